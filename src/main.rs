use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use path_clean::PathClean;

use gemini_serv::fs::read_file_as_bytes;
use gemini_serv::gemini::{
    Client, Handler, Response, ResponseCode, Server, Uri, DEFAULT_GEMINI_PORT,
    DEFAULT_MAX_PARALLEL_CONNECTIONS,
};

#[derive(Debug)]
pub struct EnvConfig {
    pub hostname: String,
    pub port: u16,
    pub key_path: String,
    pub cert_path: String,
    pub server_root: String,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        let hostname = env::var("GEMINI_SERVER_HOSTNAME").unwrap_or("127.0.0.1".to_string());
        let port = match env::var("GEMINI_SERVER_PORT") {
            Ok(port) => port
                .parse()
                .with_context(|| format!("Invalid GEMINI_SERVER_PORT {}", port))?,
            Err(_) => DEFAULT_GEMINI_PORT,
        };
        let key_path = env::var("GEMINI_SERVER_TLS_KEY_FILENAME").with_context(|| {
            "Missing environment variable GEMINI_SERVER_TLS_KEY_FILENAME".to_string()
        })?;
        let cert_path = env::var("GEMINI_SERVER_TLS_CERT_FILENAME").with_context(|| {
            "Missing environment variable GEMINI_SERVER_TLS_CERT_FILENAME".to_string()
        })?;
        let server_root = env::var("GEMINI_SERVER_ROOT_DIRECTORY").with_context(|| {
            "Missing environment variable GEMINI_SERVER_ROOT_DIRECTORY".to_string()
        })?;
        Ok(Self {
            hostname,
            port,
            key_path,
            cert_path,
            server_root,
        })
    }
}

/// Serves files from a root directory as a Gemini capsule.
struct FileServer {
    server_root: String,
}

impl Handler for FileServer {
    fn respond(&self, uri: &Uri, client: &Client) -> Response {
        match self.serve(&uri.path()) {
            Ok(response) => response,
            Err(e) => {
                let ip = client.ip_address().unwrap_or_else(|_| "?".to_string());
                error!("{} Failed to serve {}: {:?}", ip, uri, e);
                Response::new(ResponseCode::TemporaryFailure, "error")
            }
        }
    }
}

impl FileServer {
    fn serve(&self, path: &str) -> Result<Response> {
        let filename = resolve_path(&self.server_root, path)?;
        if !filename.is_file() {
            return Ok(Response::new(ResponseCode::NotFound, "not found"));
        }
        let mime_type = match guess_mime_type(&filename) {
            Some(mime_type) => mime_type,
            None => {
                info!("Cannot guess mime type {:?}", filename);
                return Ok(Response::new(ResponseCode::NotFound, "not found"));
            }
        };
        info!("Opening file {:?}", filename);
        let data = read_file_as_bytes(&filename)?;
        Ok(Response::with_bytes(ResponseCode::Success, mime_type, data))
    }
}

/// Resolve the absolute path of the file to serve.
/// The final path must always begin with the root path
/// (no escape outside root!). If the final path is a
/// directory, append index.gmi.
fn resolve_path(root_path: &str, input: &str) -> Result<PathBuf> {
    let root = PathBuf::from(root_path);
    let mut requested = PathBuf::from(input);
    if requested.is_absolute() {
        requested = requested.strip_prefix("/")?.to_path_buf();
    }
    let mut final_path = root.join(requested).clean();
    if !final_path.starts_with(&root) {
        return Err(anyhow!("Invalid path {:?} -> {:?}", input, final_path));
    }
    if final_path.is_dir() {
        final_path = final_path.join("index.gmi");
    }
    Ok(final_path)
}

fn guess_mime_type(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "gmi" => Some("text/gemini"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}

fn serve(config: &EnvConfig) -> Result<()> {
    let server = Server::new(
        Some(&config.hostname),
        config.port,
        FileServer {
            server_root: config.server_root.clone(),
        },
    )?;
    server.use_certificate_file(&config.cert_path)?;
    server.use_private_key_file(&config.key_path)?;
    server.accept_clients(DEFAULT_MAX_PARALLEL_CONNECTIONS)?;
    Ok(())
}

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    env_logger::init();
    let env_config = match EnvConfig::from_env() {
        Err(e) => {
            error!("{:#?}", e);
            return 1;
        }
        Ok(x) => x,
    };
    if let Err(e) = serve(&env_config) {
        error!("{:#?}", e);
        return 1;
    }
    0
}
