use actix_web::middleware::DefaultHeaders;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

const ENV_FILE_VARS: [&str; 2] = ["ENV_FILE", "DOTENV_PATH"];

/// Env file named by `ENV_FILE` or `DOTENV_PATH`, if either points at a real file.
fn explicit_env_file(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    ENV_FILE_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .map(|raw| PathBuf::from(raw.trim()))
        .find(|path| !path.as_os_str().is_empty() && path.is_file())
}

/// Load env files (already-set variables win), then install the fmt subscriber.
///
/// `RUST_LOG` selects the filter; `info` when unset or unparsable.
pub fn init_tracing() {
    let loaded: Option<PathBuf> = match explicit_env_file(|v| std::env::var(v).ok()) {
        Some(path) => dotenvy::from_path(&path).ok().map(|_| path),
        None => dotenvy::dotenv().ok(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();

    match loaded {
        Some(path) => tracing::info!(env_file = %path.display(), "loaded environment file"),
        None => tracing::debug!("no environment file loaded"),
    }
}

pub(crate) fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn non_blank_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Upstream HTTP client.
///
/// `LXD_NO_PROXY` turns proxies off. Otherwise `LXD_PROXY_URL` applies to every scheme and
/// `HTTP_PROXY` / `HTTPS_PROXY` (either case) to their own. There is no overall request
/// timeout because streams last as long as the worker keeps writing.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("lxd-gateway/", env!("CARGO_PKG_VERSION")));

    if env_truthy("LXD_NO_PROXY") {
        builder = builder.no_proxy();
    } else {
        let proxies = [
            ("all", non_blank_env(&["LXD_PROXY_URL"])),
            ("http", non_blank_env(&["HTTP_PROXY", "http_proxy"])),
            ("https", non_blank_env(&["HTTPS_PROXY", "https_proxy"])),
        ];
        for (scheme, url) in proxies {
            let Some(url) = url else { continue };
            let proxy = match scheme {
                "http" => reqwest::Proxy::http(url.as_str()),
                "https" => reqwest::Proxy::https(url.as_str()),
                _ => reqwest::Proxy::all(url.as_str()),
            };
            match proxy {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => tracing::warn!(scheme, proxy = %url, error = %err, "ignoring invalid proxy url"),
            }
        }
    }

    builder.build().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "falling back to default HTTP client");
        reqwest::Client::new()
    })
}

/// CORS headers stamped on every response, errors included.
///
/// Responses that already carry a header (e.g. from the `Cors` middleware) keep it.
pub fn cors_default_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add(("Access-Control-Allow-Origin", "*"))
        .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
        .add(("Access-Control-Allow-Headers", "Content-Type, Authorization"))
}

/// Build a CORS configuration from environment variables for Actix-web.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_ALLOW_CREDENTIALS: enable with 1,true,yes,on
/// - CORS_MAX_AGE: max age in seconds (usize)
///
/// Defaults are permissive. Preflight handling is left to the `OPTIONS` route so
/// that every `OPTIONS` request is answered with an empty 200.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default().disable_preflight();
    let credentials = env_truthy("CORS_ALLOW_CREDENTIALS");

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => {
            cors = cors.allow_any_origin();
            if !credentials {
                cors = cors.send_wildcard();
            }
        }
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods: Vec<&str> = methods
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in headers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if credentials {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
