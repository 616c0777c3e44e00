//! Google Cloud Storage blob store.
//!
//! Reads object metadata and media from a GCS bucket via the JSON API
//! using `reqwest`.  Media downloads are ranged with a standard `Range`
//! request header, so partial reads never pull the whole object.
//!
//! Credentials are resolved once at construction via Application
//! Default Credentials (ADC):
//!   - an explicit credentials file from configuration
//!   - `GOOGLE_APPLICATION_CREDENTIALS` (service account / ADC JSON)
//!   - gcloud CLI auth (`gcloud auth application-default login`)
//!   - `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable
//!   - the GCE metadata server (when running on Google Cloud)

use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{HeaderValue, AUTHORIZATION, RANGE};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::backend::{BlobStore, BlobStream, ObjectMetadata, ReadError};

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// Safety margin subtracted from a token's lifetime before refresh.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// -- GCS JSON API resource types ----------------------------------------------

/// Subset of the GCS object resource the gateway consumes.
#[derive(Debug, Deserialize, Default)]
struct GcsObjectResource {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    /// GCS reports size as a decimal string.
    size: Option<String>,
    /// RFC 3339 timestamp of the last content update.
    updated: Option<String>,
    etag: Option<String>,
}

impl GcsObjectResource {
    fn into_metadata(self) -> ObjectMetadata {
        ObjectMetadata {
            content_type: self.content_type,
            size: self.size.and_then(|s| s.parse().ok()),
            last_modified: self.updated.as_deref().and_then(parse_rfc3339),
            validator: self.etag,
        }
    }
}

// -- Credential resolution ----------------------------------------------------

/// Where OAuth2 access tokens come from, decided once at construction.
enum CredentialSource {
    /// Service-account or authorized-user JSON file.
    AdcFile(PathBuf),
    /// Static token from `GOOGLE_OAUTH_ACCESS_TOKEN`.
    EnvToken(String),
    /// GCE metadata server.
    MetadataServer,
}

impl CredentialSource {
    /// Resolve the credential source from configuration and environment.
    fn resolve(credentials_file: &str) -> Self {
        if !credentials_file.is_empty() {
            return CredentialSource::AdcFile(PathBuf::from(credentials_file));
        }
        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return CredentialSource::AdcFile(PathBuf::from(path));
        }
        let gcloud_adc = Self::gcloud_adc_path();
        if gcloud_adc.exists() {
            return CredentialSource::AdcFile(gcloud_adc);
        }
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return CredentialSource::EnvToken(token);
        }
        CredentialSource::MetadataServer
    }

    /// Path of the gcloud application-default credentials file.
    fn gcloud_adc_path() -> PathBuf {
        if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
            return PathBuf::from(config_dir).join("application_default_credentials.json");
        }
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(".config/gcloud/application_default_credentials.json")
    }
}

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

// -- Backend ------------------------------------------------------------------

/// Blob store that reads from a Google Cloud Storage bucket.
pub struct GcsStore {
    /// HTTP client for GCS JSON API calls.
    client: reqwest::Client,
    /// The backing GCS bucket name.
    bucket: String,
    /// GCP project ID.
    #[allow(dead_code)]
    project: String,
    /// Object name prefix in the backing bucket.
    prefix: String,
    /// Where tokens are minted from.
    credentials: CredentialSource,
    /// Cached OAuth2 access token.
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsStore {
    /// Create a new GCS store.
    ///
    /// The gateway imposes no read deadline of its own, so the client
    /// carries only a connect timeout; stalled reads surface as backend
    /// errors, not local ones.
    pub async fn new(
        bucket: String,
        project: String,
        prefix: String,
        credentials_file: String,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        let credentials = CredentialSource::resolve(&credentials_file);

        info!(
            "GCS store initialized: bucket={} project={} prefix='{}'",
            bucket, project, prefix
        );

        Ok(Self {
            client,
            bucket,
            project,
            prefix,
            credentials,
            token_cache: Mutex::new(None),
        })
    }

    /// Map a gateway object name to the upstream GCS object name.
    fn gcs_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// URL for the object's metadata resource.
    fn metadata_url(&self, gcs_name: &str) -> String {
        format!(
            "{GCS_API_BASE}/storage/v1/b/{}/o/{}",
            self.bucket,
            utf8_percent_encode(gcs_name, NON_ALPHANUMERIC)
        )
    }

    // -- Token management -----------------------------------------------------

    /// Get an OAuth2 access token, refreshing the cache when expired.
    async fn access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.token_cache.lock().expect("token cache mutex poisoned");
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.mint_token().await?;
        let expiry = Instant::now()
            + Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);

        let mut cache = self.token_cache.lock().expect("token cache mutex poisoned");
        *cache = Some(CachedToken {
            access_token: token.clone(),
            expiry,
        });

        Ok(token)
    }

    /// Mint a fresh token from the resolved credential source.
    async fn mint_token(&self) -> anyhow::Result<(String, u64)> {
        match &self.credentials {
            CredentialSource::EnvToken(token) => Ok((token.clone(), 3600)),
            CredentialSource::AdcFile(path) => self.token_from_adc_file(path).await,
            CredentialSource::MetadataServer => self.token_from_metadata_server().await,
        }
    }

    /// Obtain a token from a credentials JSON file.
    async fn token_from_adc_file(&self, path: &PathBuf) -> anyhow::Result<(String, u64)> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read credentials file {path:?}: {e}"))?;

        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse credentials file: {e}"))?;

        let field = |name: &str| creds.get(name).and_then(|v| v.as_str()).unwrap_or("");

        match field("type") {
            "authorized_user" => {
                self.token_from_refresh(
                    field("client_id"),
                    field("client_secret"),
                    field("refresh_token"),
                )
                .await
            }
            "service_account" => {
                // Signing a service-account JWT needs an RSA implementation
                // this crate does not carry.  Fall back to the ambient
                // token sources, as a GCE/GKE deployment would use anyway.
                warn!(
                    "Service-account JWT signing is not supported; falling back \
                     to GOOGLE_OAUTH_ACCESS_TOKEN or the metadata server"
                );
                if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
                    return Ok((token, 3600));
                }
                self.token_from_metadata_server().await
            }
            other => Err(anyhow::anyhow!(
                "Unsupported credential type in {path:?}: {other}"
            )),
        }
    }

    /// Exchange a refresh token for an access token.
    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token refresh request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Token refresh failed ({status}): {body}"));
        }

        Self::parse_token_response(resp.json().await?)
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .get(
                "http://metadata.google.internal/computeMetadata/v1/instance/\
                 service-accounts/default/token",
            )
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Metadata server request failed: {e}. Set \
                     GOOGLE_APPLICATION_CREDENTIALS, run 'gcloud auth \
                     application-default login', or set GOOGLE_OAUTH_ACCESS_TOKEN."
                )
            })?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "Metadata server returned {}: no usable GCP credentials found",
                resp.status()
            ));
        }

        Self::parse_token_response(resp.json().await?)
    }

    fn parse_token_response(body: serde_json::Value) -> anyhow::Result<(String, u64)> {
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("No access_token in token response"))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(3600);
        Ok((access_token, expires_in))
    }
}

/// Map a mid-stream `reqwest` failure onto the read-error contract.
fn map_media_error(err: reqwest::Error) -> ReadError {
    if err.is_timeout() {
        ReadError::Code {
            code: "ETIMEDOUT".to_string(),
            message: err.to_string(),
        }
    } else {
        ReadError::Other(anyhow::Error::new(err))
    }
}

impl BlobStore for GcsStore {
    fn fetch_metadata(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectMetadata>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let gcs_name = self.gcs_name(&name);
            let token = self.access_token().await?;

            debug!("GCS metadata fetch: bucket={} name={}", self.bucket, gcs_name);

            let resp = self
                .client
                .get(self.metadata_url(&gcs_name))
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS metadata request failed: {e}"))?;

            let status = resp.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow::anyhow!(
                    "GCS metadata request for {gcs_name} returned {status}: {body}"
                ));
            }

            // A payload that is not an object resource degrades to empty
            // metadata; downstream tolerates all fields being absent.
            let resource: GcsObjectResource = match resp.json().await {
                Ok(resource) => resource,
                Err(e) => {
                    warn!("Malformed GCS metadata payload for {gcs_name}: {e}");
                    GcsObjectResource::default()
                }
            };

            Ok(Some(resource.into_metadata()))
        })
    }

    fn open_read_stream(
        &self,
        name: &str,
        range: Option<(u64, u64)>,
    ) -> Pin<Box<dyn Future<Output = Result<BlobStream, ReadError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let gcs_name = self.gcs_name(&name);
            let token = self.access_token().await.map_err(ReadError::Other)?;

            let mut req = self
                .client
                .get(format!("{}?alt=media", self.metadata_url(&gcs_name)))
                .header(AUTHORIZATION, format!("Bearer {token}"));

            if let Some((start, end)) = range {
                req = req.header(
                    RANGE,
                    HeaderValue::from_str(&format!("bytes={start}-{end}"))
                        .expect("range header value is ASCII"),
                );
            }

            debug!(
                "GCS media open: bucket={} name={} range={:?}",
                self.bucket, gcs_name, range
            );

            let resp = req.send().await.map_err(map_media_error)?;

            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                return Err(ReadError::Upstream {
                    status: status.as_u16(),
                    message,
                });
            }

            let chunks = resp
                .bytes_stream()
                .map(|item| item.map_err(map_media_error))
                .boxed();

            Ok(BlobStream::new(chunks).with_release_hook(move || {
                debug!("Aborted GCS media download for {gcs_name}");
            }))
        })
    }
}

// -- RFC 3339 parsing ---------------------------------------------------------

/// Parse an RFC 3339 timestamp (`2024-01-01T00:00:00.000Z`) to a
/// `SystemTime`, truncated to whole seconds.
fn parse_rfc3339(iso: &str) -> Option<SystemTime> {
    if iso.len() < 19 {
        return None;
    }
    let year: i32 = iso[0..4].parse().ok()?;
    let month: u32 = iso[5..7].parse().ok()?;
    let day: u32 = iso[8..10].parse().ok()?;
    let hours: u32 = iso[11..13].parse().ok()?;
    let minutes: u32 = iso[14..16].parse().ok()?;
    let seconds: u32 = iso[17..19].parse().ok()?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hours > 23 || minutes > 59 {
        return None;
    }

    let days = ymd_to_days(year, month, day);
    if days < 0 {
        return None;
    }
    let total_secs =
        days as u64 * 86_400 + hours as u64 * 3_600 + minutes as u64 * 60 + seconds as u64;

    Some(UNIX_EPOCH + Duration::from_secs(total_secs))
}

/// Convert (year, month, day) to days since the Unix epoch
/// (Howard Hinnant's civil-from-days inverse).
fn ymd_to_days(year: i32, month: u32, day: u32) -> i64 {
    let y = if month <= 2 {
        year as i64 - 1
    } else {
        year as i64
    };
    let m = if month <= 2 {
        month as i64 + 9
    } else {
        month as i64 - 3
    };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u64;
    let doy = (153 * m as u64 + 2) / 5 + day as u64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;

    era * 146_097 + doe as i64 - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rfc3339_epoch_round_trip() {
        let time = parse_rfc3339("1970-01-01T00:00:00Z").unwrap();
        assert_eq!(time, UNIX_EPOCH);
    }

    #[test]
    fn parse_rfc3339_truncates_millis() {
        let with_millis = parse_rfc3339("2024-01-01T00:00:00.999Z").unwrap();
        let without = parse_rfc3339("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(with_millis, without);
    }

    #[test]
    fn parse_rfc3339_known_date() {
        // 2024-01-01T00:00:00Z == 1704067200 seconds since epoch.
        let time = parse_rfc3339("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(
            time.duration_since(UNIX_EPOCH).unwrap().as_secs(),
            1_704_067_200
        );
    }

    #[test]
    fn parse_rfc3339_rejects_garbage() {
        assert!(parse_rfc3339("").is_none());
        assert!(parse_rfc3339("not a date").is_none());
        assert!(parse_rfc3339("2024-13-01T00:00:00Z").is_none());
    }

    #[test]
    fn metadata_conversion_parses_size_and_drops_bad_fields() {
        let resource = GcsObjectResource {
            content_type: Some("image/png".to_string()),
            size: Some("1000".to_string()),
            updated: Some("2024-01-01T00:00:00.000Z".to_string()),
            etag: Some("abc".to_string()),
        };
        let meta = resource.into_metadata();
        assert_eq!(meta.size, Some(1000));
        assert_eq!(meta.content_type.as_deref(), Some("image/png"));
        assert_eq!(meta.validator.as_deref(), Some("abc"));
        assert!(meta.last_modified.is_some());

        let resource = GcsObjectResource {
            size: Some("not-a-number".to_string()),
            updated: Some("garbage".to_string()),
            ..Default::default()
        };
        let meta = resource.into_metadata();
        assert_eq!(meta, ObjectMetadata::default());
    }
}
