pub mod rules;
pub mod streaming;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatch::{await_reply, CacheRequest, Dispatcher, Origin};
use crate::dispatch::request::classify_path;
use crate::logging::{log_access, AccessEvent};
use crate::metrics;
use crate::settings::Settings;

use rules::{select_upstream, Backend, UpstreamRule};
use streaming::{full_body, TrackedBody};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_ORIGINAL_HOST: HeaderName = HeaderName::from_static("x-original-host");

/// Classifies incoming requests, rewrites them for the selected upstream, and
/// streams worker replies back to clients.
pub struct Router {
    dispatcher: Arc<Dispatcher>,
    data_dir: PathBuf,
    rules: Vec<UpstreamRule>,
    default_backend: Backend,
}

impl Router {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: &Settings) -> Result<Self> {
        let rules = settings
            .upstream_rules
            .iter()
            .map(|rule| UpstreamRule::new(&rule.regex, &rule.host, &rule.scheme))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dispatcher,
            data_dir: settings.data_dir.clone(),
            rules,
            default_backend: Backend {
                host: settings.default_backend.host.clone(),
                scheme: settings.default_backend.scheme.clone(),
            },
        })
    }

    pub async fn handle(&self, peer: SocketAddr, req: Request<Incoming>) -> Response<TrackedBody> {
        if req.uri().path() == "/health" && req.uri().query().is_none() {
            return plain_response(StatusCode::OK, "Healthy");
        }

        let started = std::time::Instant::now();
        let method = req.method().clone();
        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let (upstream_host, scheme) =
            select_upstream(&self.rules, &self.default_backend, &original_host);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let url = match Url::parse(&format!("{scheme}://{upstream_host}{path_and_query}")) {
            Ok(url) => url,
            Err(err) => {
                error!(host = %upstream_host, error = %err, "failed to build upstream url");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream target");
            }
        };

        let (parts, incoming) = req.into_parts();
        let mut headers = parts.headers;
        append_forwarded_for(&mut headers, peer.ip());
        if let Ok(value) = HeaderValue::from_str(&original_host) {
            headers.insert(X_ORIGINAL_HOST.clone(), value);
        }
        // the outbound client derives Host from the rewritten URL
        headers.remove(HOST);

        let body = if matches!(method, Method::GET | Method::HEAD) {
            None
        } else {
            Some(reqwest::Body::wrap_stream(incoming.into_data_stream()))
        };

        let (cr, reply) = CacheRequest::new(method.clone(), url, headers, body, &self.data_dir);
        let cache_enabled = cr.cache_enabled();
        let path = cr.url.path().to_string();

        self.dispatcher.push(cr).await;
        let cresp = match await_reply(reply).await {
            Ok(cresp) => cresp,
            Err(err) => {
                error!(path = %path, error = %err, "no reply from worker");
                return plain_response(StatusCode::BAD_GATEWAY, "worker unavailable");
            }
        };

        if cache_enabled && cresp.origin != Origin::Cache {
            if let Some((item, digest)) = classify_path(&path) {
                metrics::record_cache_miss(item, digest);
            }
        }

        let origin = cresp.origin;
        let response = streaming::build_response(cresp, &path);
        log_access(AccessEvent {
            origin: origin.as_str(),
            status: response.status().as_u16(),
            method: &method,
            host: &original_host,
            path: &path,
            elapsed: started.elapsed(),
        });
        response
    }
}

/// Fold the client address into `X-Forwarded-For`, preserving prior proxies
/// as a comma-separated list collapsed into a single header.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<TrackedBody> {
    let mut response = Response::new(TrackedBody::untracked(full_body(body)));
    *response.status_mut() = status;
    response
}

/// TLS-terminating accept loop. Runs until the shutdown signal fires; spawned
/// connections finish streaming on their own.
pub async fn serve(
    router: Arc<Router>,
    settings: &Settings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let acceptor = crate::tls::build_tls_acceptor(&settings.tls.cert, &settings.tls.key)?;
    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    info!(address = %settings.listen, "proxy listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutting down proxy listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            debug!(peer = %peer, error = %err, "tls handshake failed");
                            return;
                        }
                    };
                    let service = service_fn(move |req| {
                        let router = router.clone();
                        async move { Ok::<_, Infallible>(router.handle(peer, req).await) }
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_starts_with_the_client_ip() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.1.2.3".parse().unwrap());
        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "10.1.2.3"
        );
    }

    #[test]
    fn forwarded_for_folds_prior_proxies_into_one_header() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", "192.0.2.1".parse().unwrap());
        headers.append("x-forwarded-for", "192.0.2.2".parse().unwrap());
        append_forwarded_for(&mut headers, "10.1.2.3".parse().unwrap());

        let values: Vec<_> = headers.get_all("x-forwarded-for").iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].to_str().unwrap(),
            "192.0.2.1, 192.0.2.2, 10.1.2.3"
        );
    }
}
