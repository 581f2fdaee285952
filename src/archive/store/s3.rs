use crate::archive::aws_sigv4::{AwsCredentials, SigningScope, default_region, sign_request};
use crate::archive::config::ObjectStoreConfig;
use crate::archive::store::{ObjectStore, join_key, render_document};
use crate::error::ObjectStoreError;
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// S3-compatible store addressed as `s3://bucket/prefix`.
pub struct S3ObjectStore {
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<Url>,
    path_style: bool,
    credentials: AwsCredentials,
    client: Client,
}

impl S3ObjectStore {
    pub fn from_config(cfg: &ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let (bucket, prefix) = parse_s3_root(&cfg.root)?;
        let endpoint = cfg
            .endpoint
            .as_deref()
            .map(|raw| {
                Url::parse(raw.trim())
                    .map_err(|err| ObjectStoreError::Config(format!("invalid endpoint `{raw}`: {err}")))
            })
            .transpose()?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            bucket,
            prefix,
            region: cfg.region.clone().unwrap_or_else(default_region),
            endpoint,
            path_style: cfg.path_style,
            credentials: AwsCredentials::from_env()?,
            client,
        })
    }

    fn key_for(&self, relative_path: &str) -> String {
        join_key(&self.prefix, relative_path)
    }

    /// Path-style puts the bucket in the path; virtual-host style puts it in
    /// the host name.
    fn object_url(&self, key: &str) -> Result<Url, ObjectStoreError> {
        let raw = match (&self.endpoint, self.path_style) {
            (Some(endpoint), true) => format!(
                "{}/{}/{key}",
                endpoint.as_str().trim_end_matches('/'),
                self.bucket
            ),
            (Some(endpoint), false) => {
                let host = endpoint.host_str().ok_or_else(|| {
                    ObjectStoreError::Config(format!("endpoint has no host: {endpoint}"))
                })?;
                let port = endpoint.port().map(|p| format!(":{p}")).unwrap_or_default();
                format!(
                    "{}://{}.{host}{port}/{key}",
                    endpoint.scheme(),
                    self.bucket
                )
            }
            (None, true) => format!("https://s3.{}.amazonaws.com/{}/{key}", self.region, self.bucket),
            (None, false) => format!("https://{}.s3.{}.amazonaws.com/{key}", self.bucket, self.region),
        };
        Url::parse(&raw).map_err(|err| ObjectStoreError::Config(format!("invalid object url `{raw}`: {err}")))
    }

    fn put(&self, relative_path: &str, document: &Value, if_absent: bool) -> Result<String, ObjectStoreError> {
        let reference = self.ref_for(relative_path);
        let url = self.object_url(&self.key_for(relative_path))?;
        let body = render_document(document)?;

        let mut signed_extra = vec![("content-type", "application/json")];
        if if_absent {
            signed_extra.push(("if-none-match", "*"));
        }
        let signed = sign_request(
            "PUT",
            &url,
            &signed_extra,
            &body,
            &self.credentials,
            SigningScope {
                region: &self.region,
                service: "s3",
            },
            Utc::now(),
        )?;

        let mut request = self.client.put(url);
        for (name, value) in &signed_extra {
            request = request.header(*name, *value);
        }
        let response = signed.apply(request).body(body).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(reference);
        }
        if if_absent && matches!(status, StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT) {
            return Err(ObjectStoreError::AlreadyExists { reference });
        }
        let body = response.text().unwrap_or_default();
        Err(ObjectStoreError::Http {
            reference,
            status: status.as_u16(),
            body: crate::archive::util::truncate_with_ellipsis(&body, 512),
        })
    }
}

impl ObjectStore for S3ObjectStore {
    fn ref_for(&self, relative_path: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.key_for(relative_path))
    }

    fn write_json_if_absent(
        &self,
        relative_path: &str,
        document: &Value,
    ) -> Result<String, ObjectStoreError> {
        self.put(relative_path, document, true)
    }

    fn write_json(&self, relative_path: &str, document: &Value) -> Result<String, ObjectStoreError> {
        self.put(relative_path, document, false)
    }
}

fn parse_s3_root(root: &str) -> Result<(String, String), ObjectStoreError> {
    let rest = root
        .trim()
        .strip_prefix("s3://")
        .ok_or_else(|| ObjectStoreError::Config(format!("not an s3 root: `{root}`")))?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(ObjectStoreError::Config(format!("s3 root has no bucket: `{root}`")));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(endpoint: Option<&str>, path_style: bool) -> S3ObjectStore {
        let (bucket, prefix) = parse_s3_root("s3://fraud-archive/platform/").expect("root");
        S3ObjectStore {
            bucket,
            prefix,
            region: "eu-west-2".to_string(),
            endpoint: endpoint.map(|e| Url::parse(e).expect("endpoint")),
            path_style,
            credentials: AwsCredentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            client: Client::new(),
        }
    }

    #[test]
    fn parses_bucket_and_prefix() {
        assert_eq!(
            parse_s3_root("s3://b/a/b/").expect("root"),
            ("b".to_string(), "a/b".to_string())
        );
        assert_eq!(parse_s3_root("s3://b").expect("root"), ("b".to_string(), String::new()));
        assert!(parse_s3_root("s3:///x").is_err());
        assert!(parse_s3_root("/local").is_err());
    }

    #[test]
    fn refs_include_bucket_and_prefix() {
        let s = store(None, false);
        assert_eq!(s.ref_for("run/x.json"), "s3://fraud-archive/platform/run/x.json");
    }

    #[test]
    fn addressing_styles() {
        let key = "platform/run/x.json";
        assert_eq!(
            store(None, false).object_url(key).expect("url").as_str(),
            "https://fraud-archive.s3.eu-west-2.amazonaws.com/platform/run/x.json"
        );
        assert_eq!(
            store(Some("http://localhost:4566"), true).object_url(key).expect("url").as_str(),
            "http://localhost:4566/fraud-archive/platform/run/x.json"
        );
        assert_eq!(
            store(Some("https://minio.internal:9000"), false)
                .object_url(key)
                .expect("url")
                .as_str(),
            "https://fraud-archive.minio.internal:9000/platform/run/x.json"
        );
    }
}
