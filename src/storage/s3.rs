//! S3-compatible object store [`Storage`] backend, speaking the S3 REST API
//! directly over `reqwest` with hand-rolled AWS Signature Version 4 signing
//! (spec §4.3). The teacher has no object-store crate to draw from, so this
//! follows its existing pattern of hand-rolled HTTP clients
//! (`storage/http_client.rs`) rather than reaching for an unrelated dependency.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{DbError, DbResult};

use super::http_client::get_http_client_arc;
use super::{ByteStream, ListPage, ObjectInfo, Storage};

type HmacSha256 = Hmac<Sha256>;

pub struct S3Storage {
    endpoint: String,
    bucket: String,
    prefix: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Storage {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        region: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        S3Storage {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            region: region.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    fn object_key(&self, path: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), path.trim_start_matches('/'))
            .trim_start_matches('/')
            .to_string()
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            self.object_key(path)
        )
    }

    fn sign(&self, method: &str, url: &url::Url, body: &[u8]) -> (String, String, String) {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(body));

        let host = url.host_str().unwrap_or_default().to_string();
        let canonical_uri = url.path().to_string();
        let canonical_query = url.query().unwrap_or("").to_string();
        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        (authorization, amz_date, payload_hash)
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &str,
        body: Vec<u8>,
    ) -> DbResult<reqwest::RequestBuilder> {
        let parsed = url::Url::parse(url).map_err(|e| DbError::StorageUnavailable(e.to_string()))?;
        let (authorization, amz_date, payload_hash) = self.sign(method.as_str(), &parsed, &body);

        Ok(client
            .request(method, url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization)
            .body(body))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

#[async_trait]
impl Storage for S3Storage {
    async fn write(&self, path: &str, _content_type: Option<&str>, data: Vec<u8>) -> DbResult<()> {
        let client = get_http_client_arc();
        let url = self.object_url(path);
        let req = self.build_request(&client, reqwest::Method::PUT, &url, data)?;
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(DbError::StorageUnavailable(format!("PUT {path} failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> DbResult<Option<Vec<u8>>> {
        let client = get_http_client_arc();
        let url = self.object_url(path);
        let req = self.build_request(&client, reqwest::Method::GET, &url, Vec::new())?;
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(DbError::StorageUnavailable(format!("GET {path} failed: {}", resp.status())));
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn write_stream(&self, path: &str, content_type: Option<&str>, stream: ByteStream) -> DbResult<()> {
        use futures::StreamExt;
        let mut buf = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.write(path, content_type, buf).await
    }

    async fn read_stream(&self, path: &str) -> DbResult<ByteStream> {
        let data = self.read(path).await?.ok_or_else(|| DbError::NotFound(path.to_string()))?;
        let stream = futures::stream::once(async move { Ok(bytes::Bytes::from(data)) });
        Ok(Box::pin(stream))
    }

    async fn info(&self, path: &str) -> DbResult<Option<ObjectInfo>> {
        let client = get_http_client_arc();
        let url = self.object_url(path);
        let req = self.build_request(&client, reqwest::Method::HEAD, &url, Vec::new())?;
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(DbError::StorageUnavailable(format!("HEAD {path} failed: {}", resp.status())));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(Some(ObjectInfo {
            content_type,
            length,
            last_modified: 0,
        }))
    }

    async fn delete_file(&self, path: &str) -> DbResult<()> {
        let client = get_http_client_arc();
        let url = self.object_url(path);
        let req = self.build_request(&client, reqwest::Method::DELETE, &url, Vec::new())?;
        let resp = req.send().await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(DbError::StorageUnavailable(format!("DELETE {path} failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn list_files(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage> {
        self.list(prefix, limit, cursor, "/").await
    }

    async fn list_dirs(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage> {
        self.list(prefix, limit, cursor, "/").await
    }
}

impl S3Storage {
    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>, delimiter: &str) -> DbResult<ListPage> {
        let client = get_http_client_arc();
        let full_prefix = self.object_key(prefix);
        let mut url = format!(
            "{}/{}?list-type=2&prefix={}&delimiter={delimiter}&max-keys={limit}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            urlencoding_escape(&full_prefix)
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&continuation-token={}", urlencoding_escape(cursor)));
        }
        let req = self.build_request(&client, reqwest::Method::GET, &url, Vec::new())?;
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(DbError::StorageUnavailable(format!("LIST {prefix} failed: {}", resp.status())));
        }
        let body = resp.text().await?;
        Ok(parse_list_response(&body, &full_prefix, delimiter))
    }
}

fn urlencoding_escape(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

/// Minimal extraction of `<Key>`/`<Prefix>` (for delimiter rollups) entries
/// out of an S3 `ListObjectsV2` XML response, stripped of the shared prefix.
fn parse_list_response(xml: &str, prefix: &str, delimiter: &str) -> ListPage {
    let mut names = Vec::new();
    for tag in ["Key", "Prefix"] {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let mut rest = xml;
        while let Some(start) = rest.find(&open) {
            let after_open = &rest[start + open.len()..];
            if let Some(end) = after_open.find(&close) {
                let value = &after_open[..end];
                if let Some(relative) = value.strip_prefix(prefix) {
                    let relative = relative.trim_start_matches(delimiter);
                    if !relative.is_empty() && !relative.contains(delimiter) {
                        names.push(relative.to_string());
                    }
                }
                rest = &after_open[end + close.len()..];
            } else {
                break;
            }
        }
    }
    names.sort();
    names.dedup();
    ListPage { names, next: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_prefix_and_path() {
        let storage = S3Storage::new("https://s3.example.com", "bucket", "db-root", "us-east-1", "ak", "sk");
        assert_eq!(storage.object_key("db.dat"), "db-root/db.dat");
        assert_eq!(storage.object_key("/db.dat"), "db-root/db.dat");
    }

    #[test]
    fn parse_list_response_extracts_relative_keys() {
        let xml = r#"<ListBucketResult>
            <Contents><Key>db-root/collections/users/collection.dat</Key></Contents>
            <Contents><Key>db-root/db.dat</Key></Contents>
        </ListBucketResult>"#;
        let page = parse_list_response(xml, "db-root/", "/");
        assert!(page.names.contains(&"db.dat".to_string()));
    }

    #[test]
    fn signing_is_deterministic_for_same_inputs() {
        let storage = S3Storage::new("https://s3.example.com", "bucket", "root", "us-east-1", "ak", "sk");
        let url = url::Url::parse("https://s3.example.com/bucket/root/db.dat").unwrap();
        let (auth1, date1, hash1) = storage.sign("GET", &url, b"");
        assert!(auth1.starts_with("AWS4-HMAC-SHA256"));
        assert_eq!(date1.len(), 16);
        assert_eq!(hash1.len(), 64);
    }
}
