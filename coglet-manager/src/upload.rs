//! Output file uploads.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Long-lived upload client shared by every prediction.
pub struct Uploader {
    client: reqwest::Client,
}

impl Uploader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build upload client");
        Self { client }
    }

    /// PUT a local file under `{base_url}/{basename}` and return its
    /// canonical location.
    ///
    /// The server may answer 200, 201, or 202. A `Location` response header
    /// wins over the PUT target.
    pub async fn upload(
        &self,
        base_url: &str,
        path: &Path,
        prediction_id: &str,
    ) -> Result<String> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Upload(format!("unusable file name: {}", path.display())))?;
        let url = format!("{}/{}", base_url.trim_end_matches('/'), basename);

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let body = tokio::fs::read(path).await?;

        let response = self
            .client
            .put(&url)
            .header("X-Prediction-ID", prediction_id)
            .header(reqwest::header::CONTENT_TYPE, mime.as_ref())
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !matches!(status, 200 | 201 | 202) {
            return Err(Error::Upload(format!("{url}: unexpected status {status}")));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(url);
        Ok(location)
    }
}

impl Default for Uploader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn write_temp(name: &str, contents: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(name);
        tokio::fs::write(&file, contents).await.unwrap();
        (dir, file)
    }

    #[tokio::test]
    async fn puts_file_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/out.txt"))
            .and(header("X-Prediction-ID", "pred1"))
            .and(header("Content-Type", "text/plain"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = write_temp("out.txt", b"hello").await;
        let uploader = Uploader::new();
        let location = uploader
            .upload(&format!("{}/bucket", server.uri()), &file, "pred1")
            .await
            .unwrap();

        assert_eq!(location, format!("{}/bucket/out.txt", server.uri()));
    }

    #[tokio::test]
    async fn prefers_location_header() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Location", "https://cdn/out.txt"),
            )
            .mount(&server)
            .await;

        let (_dir, file) = write_temp("out.txt", b"hello").await;
        let uploader = Uploader::new();
        let location = uploader.upload(&server.uri(), &file, "pred1").await.unwrap();
        assert_eq!(location, "https://cdn/out.txt");
    }

    #[tokio::test]
    async fn rejects_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let (_dir, file) = write_temp("out.txt", b"hello").await;
        let uploader = Uploader::new();
        let err = uploader.upload(&server.uri(), &file, "pred1").await;
        assert!(matches!(err, Err(Error::Upload(_))));
    }

    #[tokio::test]
    async fn trailing_slash_collapses() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/out.txt"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let (_dir, file) = write_temp("out.txt", b"hello").await;
        let uploader = Uploader::new();
        uploader
            .upload(&format!("{}/", server.uri()), &file, "pred1")
            .await
            .unwrap();
    }
}
