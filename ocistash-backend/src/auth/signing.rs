//! OCI HTTP request signatures (draft-cavage, rsa-sha256).

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private};
use openssl::sign::Signer;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST};
use reqwest::{Method, Request, Url};
use sha2::{Digest, Sha256};

use super::AuthError;

pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

const CONTENT_SHA256: &str = "x-content-sha256";
const REQUEST_TARGET: &str = "(request-target)";

/// Add `date`, `host` and (for requests with a signed body) the body
/// headers, then set the `Authorization` header.
pub fn sign_request(
    req: &mut Request,
    key_id: &str,
    key: &PKeyRef<Private>,
) -> Result<(), AuthError> {
    if !req.headers().contains_key(DATE) {
        let now = Utc::now().format(DATE_FORMAT).to_string();
        req.headers_mut().insert(DATE, HeaderValue::from_str(&now)?);
    }
    let host = host_header(req.url());
    req.headers_mut().insert(HOST, HeaderValue::from_str(&host)?);

    let mut signed = vec!["date", REQUEST_TARGET, "host"];

    if signs_body(req.method(), req.url()) {
        let body: &[u8] = req.body().and_then(|b| b.as_bytes()).unwrap_or_default();
        let digest = B64.encode(Sha256::digest(body));
        let length = body.len().to_string();

        let headers = req.headers_mut();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_str(&length)?);
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers.insert(CONTENT_SHA256, HeaderValue::from_str(&digest)?);
        signed.extend(["content-length", "content-type", CONTENT_SHA256]);
    }

    let plain = signing_string(req, &signed)?;
    let mut signer = Signer::new(MessageDigest::sha256(), key).map_err(AuthError::Sign)?;
    signer.update(plain.as_bytes()).map_err(AuthError::Sign)?;
    let signature = signer.sign_to_vec().map_err(AuthError::Sign)?;

    let authorization = format!(
        "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",\
         headers=\"{}\",signature=\"{}\"",
        key_id,
        signed.join(" "),
        B64.encode(signature)
    );
    req.headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_str(&authorization)?);
    Ok(())
}

/// The newline-separated `name: value` lines covered by the signature.
pub fn signing_string(req: &Request, headers: &[&str]) -> Result<String, AuthError> {
    let mut lines = Vec::with_capacity(headers.len());
    for name in headers {
        if *name == REQUEST_TARGET {
            lines.push(format!(
                "{}: {} {}",
                REQUEST_TARGET,
                req.method().as_str().to_lowercase(),
                path_and_query(req.url())
            ));
            continue;
        }
        let value = req
            .headers()
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::MissingHeader(name.to_string()))?;
        lines.push(format!("{}: {}", name, value));
    }
    Ok(lines.join("\n"))
}

/// Object and part uploads stream their payload unsigned; other POST and
/// PUT bodies are covered by the signature.
fn signs_body(method: &Method, url: &Url) -> bool {
    if *method != Method::POST && *method != Method::PUT {
        return false;
    }
    if *method == Method::PUT {
        let segs: Vec<&str> = url.path().trim_start_matches('/').split('/').collect();
        let is_upload = segs.len() >= 6
            && segs[0] == "n"
            && segs[2] == "b"
            && (segs[4] == "o" || segs[4] == "u");
        if is_upload {
            return false;
        }
    }
    true
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}
