use super::stream::{find_subsequence, ProxyReader, ProxyWriter};
use super::{HandshakeCtx, Target};
use crate::utils::error::{PolyProxyError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use url::Url;

/// Body served for a static GET path.
#[derive(Debug, Clone)]
pub enum StaticBody {
    /// Plain text; `%(host)s` is substituted from the request's Host header.
    Text(String),
    /// Raw bytes, served verbatim.
    Raw(Vec<u8>),
}

fn request_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+)\s+(.+?)\s+(HTTP/\S+)$").expect("request line regex"))
}

/// Server-side HTTP proxy handshake: CONNECT, forward-proxy request
/// rewriting, Basic proxy auth and the static GET map. `first` is the byte
/// the dispatcher consumed to classify the stream.
pub(crate) async fn parse<R, W>(
    first: u8,
    reader: &mut ProxyReader<R>,
    writer: &mut ProxyWriter<W>,
    ctx: &HandshakeCtx<'_>,
) -> Result<Target>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = BytesMut::new();
    head.extend_from_slice(&[first]);
    head.extend_from_slice(&reader.read_until(b"\r\n\r\n").await?);

    let head_str = std::str::from_utf8(&head[..head.len() - 4])
        .map_err(|_| PolyProxyError::Malformed("request head is not valid UTF-8".to_string()))?;
    let mut lines = head_str.split("\r\n");
    let caps = request_line()
        .captures(lines.next().unwrap_or_default())
        .ok_or_else(|| PolyProxyError::Malformed("unparsable HTTP request line".to_string()))?;
    let (method, path, version) = (&caps[1], &caps[2], &caps[3]);

    let header_lines: Vec<&str> = lines.collect();
    let headers: HashMap<&str, &str> = header_lines
        .iter()
        .filter_map(|line| line.split_once(": "))
        .collect();

    let parsed_url = Url::parse(path).ok();
    let url_host = parsed_url.as_ref().and_then(|u| u.host_str());

    if method == "GET" && url_host.is_none() {
        let bare_path = path.split('?').next().unwrap_or(path);
        if let Some(body) = ctx.http_get.get(bare_path) {
            ctx.auth_table.set_authed();
            let body = match body {
                StaticBody::Text(text) => text
                    .replace("%(host)s", headers.get("Host").copied().unwrap_or(""))
                    .into_bytes(),
                StaticBody::Raw(bytes) => bytes.clone(),
            };
            let reply = format!(
                "{version} 200 OK\r\nConnection: close\r\nContent-Type: text/plain\r\n\
                 Cache-Control: max-age=900\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            writer.write(reply.as_bytes()).await?;
            writer.write(&body).await?;
            writer.drain().await?;
            return Err(PolyProxyError::ClosedByPolicy(format!(
                "served static path {bare_path}"
            )));
        }
        writer
            .write(format!("{version} 404 Not Found\r\nConnection: close\r\n\r\n").as_bytes())
            .await?;
        writer.drain().await?;
        return Err(PolyProxyError::ClosedByPolicy(format!(
            "404 {method} {bare_path}"
        )));
    }

    if !ctx.auth.is_empty() {
        let expected = format!("Basic {}", BASE64.encode(ctx.auth));
        let presented = headers.get("Proxy-Authorization").copied();
        if !ctx.auth_table.authed() && presented != Some(expected.as_str()) {
            let reply = format!(
                "{version} 407 Proxy Authentication Required\r\nConnection: close\r\n\
                 Proxy-Authenticate: Basic realm=\"simple\"\r\n\r\n"
            );
            writer.write(reply.as_bytes()).await?;
            writer.drain().await?;
            return Err(PolyProxyError::Unauthorized(
                "HTTP proxy credentials missing or invalid".to_string(),
            ));
        }
        ctx.auth_table.set_authed();
    }

    if method == "CONNECT" {
        let (host, port) = path
            .split_once(':')
            .ok_or_else(|| PolyProxyError::Malformed("CONNECT target lacks a port".to_string()))?;
        let port: u16 = port.parse().map_err(|_| {
            PolyProxyError::Malformed(format!("invalid CONNECT port in '{path}'"))
        })?;
        writer
            .write(format!("{version} 200 OK\r\nConnection: close\r\n\r\n").as_bytes())
            .await?;
        writer.drain().await?;
        debug!("HTTP CONNECT to {}:{}", host, port);
        return Ok(Target::new(host, port));
    }

    // forward proxy: strip scheme and authority, hand the rewritten request
    // to the origin as residual bytes
    let url = parsed_url.ok_or_else(|| {
        PolyProxyError::Malformed(format!("invalid forward-proxy target '{path}'"))
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| PolyProxyError::Malformed(format!("no host in target '{path}'")))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let kept = header_lines
        .iter()
        .filter(|line| !line.starts_with("Proxy-"))
        .copied()
        .collect::<Vec<_>>()
        .join("\r\n");
    let residual = format!("{method} {} {version}\r\n{kept}\r\n\r\n", origin_form(&url));

    debug!("HTTP forward {} {}:{}", method, host, port);
    Ok(Target::with_residual(host, port, Bytes::from(residual)))
}

/// Client-side CONNECT through an upstream HTTP proxy.
pub(crate) async fn connect<R, W>(
    reader: &mut ProxyReader<R>,
    writer: &mut ProxyWriter<W>,
    rauth: &[u8],
    host: &str,
    port: u16,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1");
    if !rauth.is_empty() {
        request.push_str("\r\nProxy-Authorization: Basic ");
        request.push_str(&BASE64.encode(rauth));
    }
    request.push_str("\r\n\r\n");
    writer.write(request.as_bytes()).await?;
    writer.drain().await?;
    reader.read_until(b"\r\n\r\n").await?;
    Ok(())
}

fn origin_form(url: &Url) -> String {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Rewrite a complete request head (without the trailing blank line) to
/// origin form, dropping `Proxy-*` headers. `None` if the first line is not
/// a request line.
fn rewrite_head(head: &str) -> Option<String> {
    let mut lines = head.split("\r\n");
    let caps = request_line().captures(lines.next()?)?;
    let (method, path, version) = (&caps[1], &caps[2], &caps[3]);
    let new_path = match Url::parse(path) {
        Ok(url) if url.host_str().is_some() => origin_form(&url),
        _ => path.to_string(),
    };
    let kept = lines
        .filter(|line| !line.starts_with("Proxy-"))
        .collect::<Vec<_>>()
        .join("\r\n");
    Some(format!("{method} {new_path} {version}\r\n{kept}\r\n\r\n"))
}

/// Streaming filter for the forward-proxy client direction: chunks that
/// open with an HTTP request line have the line rewritten to origin form
/// and `Proxy-*` headers dropped; everything else passes through.
#[derive(Debug, Default)]
pub struct HttpRewriter {
    pending: BytesMut,
}

impl HttpRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one relay chunk; returns the bytes ready to forward (possibly
    /// empty while a request head is still accumulating).
    pub fn feed(&mut self, chunk: &[u8]) -> Bytes {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(chunk);
            return self.flush_pending();
        }
        let Some(line_end) = find_subsequence(chunk, b"\r\n") else {
            return Bytes::copy_from_slice(chunk);
        };
        let is_request = std::str::from_utf8(&chunk[..line_end])
            .map(|line| request_line().is_match(line))
            .unwrap_or(false);
        if !is_request {
            return Bytes::copy_from_slice(chunk);
        }
        self.pending.extend_from_slice(chunk);
        self.flush_pending()
    }

    fn flush_pending(&mut self) -> Bytes {
        let Some(head_end) = find_subsequence(&self.pending, b"\r\n\r\n") else {
            return Bytes::new();
        };
        let buffered = self.pending.split().freeze();
        let body = buffered.slice(head_end + 4..);
        match std::str::from_utf8(&buffered[..head_end])
            .ok()
            .and_then(rewrite_head)
        {
            Some(head) => {
                let mut out = BytesMut::with_capacity(head.len() + body.len());
                out.extend_from_slice(head.as_bytes());
                out.extend_from_slice(&body);
                out.freeze()
            }
            // not actually rewritable: forward untouched
            None => buffered,
        }
    }
}
