//! Configuration for the Iris RESTful server.
//!
//! Options come from command-line arguments (with environment-variable
//! fallbacks under the `IRIS_` prefix) and are validated before any socket
//! is opened. Validation failures abort startup with a descriptive message.
//!
//! # Environment Variables
//!
//! - `IRIS_PORT` - Port to listen on (default: 3000)
//! - `IRIS_SLIDE_DIR` - Directory containing `{id}.iris` slide files
//! - `IRIS_CERT` / `IRIS_KEY` - PEM certificate and private key for TLS
//! - `IRIS_CORS` - Explicit `Access-Control-Allow-Origin` value
//! - `IRIS_DOC_ROOT` - Document root enabling static-file dispatch

use std::path::PathBuf;

use clap::Parser;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 3000;

/// Iris RESTful Server - streams slide tiles and metadata out of Iris
/// container files to deep-zoom viewers.
///
/// Without --root, responses carry 'Access-Control-Allow-Origin: *' unless
/// --cors supplies an explicit origin. With --root set and no --cors, the
/// header is suppressed.
#[derive(Parser, Debug, Clone)]
#[command(name = "iris-restful")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "IRIS_PORT")]
    pub port: u16,

    /// Directory containing the Iris slide files to be served.
    #[arg(short = 'd', long = "dir", env = "IRIS_SLIDE_DIR")]
    pub slide_dir: PathBuf,

    /// Public TLS certificate in PEM format for HTTPS connections.
    ///
    /// When neither --cert nor --key is given, a self-signed certificate is
    /// generated at startup with a loud warning.
    #[arg(short, long, env = "IRIS_CERT")]
    pub cert: Option<PathBuf>,

    /// Private key in PEM format matching --cert.
    #[arg(short, long, env = "IRIS_KEY")]
    pub key: Option<PathBuf>,

    /// Slide viewer domain returned in the Access-Control-Allow-Origin
    /// header.
    #[arg(short = 'o', long, env = "IRIS_CORS")]
    pub cors: Option<String>,

    /// Web viewer document root; activates the RESTful server as a static
    /// file server.
    #[arg(short = 'r', long = "root", env = "IRIS_DOC_ROOT")]
    pub doc_root: Option<PathBuf>,

    /// Disable the TLS layer; the server will respond to plain HTTP only.
    #[arg(long = "http-only", alias = "no-https", default_value_t = false)]
    pub http_only: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    /// Validate paths before the server starts.
    pub fn validate(&self) -> Result<(), String> {
        if !self.slide_dir.is_dir() {
            return Err(format!(
                "the provided slide root directory ({}) does not exist",
                self.slide_dir.display()
            ));
        }

        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(format!(
                        "the provided certificate ({}) does not exist",
                        cert.display()
                    ));
                }
                if !key.exists() {
                    return Err(format!(
                        "the provided key ({}) does not exist",
                        key.display()
                    ));
                }
            }
            (None, None) => {}
            _ => return Err("--cert and --key must be provided together".to_string()),
        }

        if let Some(doc_root) = &self.doc_root {
            if !doc_root.is_dir() {
                return Err(format!(
                    "the provided document root directory ({}) does not exist. \
                     Using the Iris RESTful server for static file serving is optional",
                    doc_root.display()
                ));
            }
        }

        Ok(())
    }

    /// The resolved `Access-Control-Allow-Origin` value: an explicit origin
    /// wins; otherwise `*`, unless the server also serves files, in which
    /// case the header is suppressed.
    pub fn allow_origin(&self) -> Option<String> {
        match &self.cors {
            Some(origin) => Some(origin.clone()),
            None if self.doc_root.is_none() => Some("*".to_string()),
            None => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
