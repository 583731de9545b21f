//! Microsoft Graph implementation of [`RemoteDrive`].

use super::auth::GraphAuthenticator;
use super::types::{ByteRange, ChildrenPage, DriveItem, UploadSession};
use super::{ByteStream, RemoteDrive};
use crate::config::{Config, DestinationConfig, SourceConfig};
use crate::utils::{MigratorError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything except RFC 3986 unreserved characters is escaped in a path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Which drive a [`GraphDrive`] addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveLocator {
    /// A user's OneDrive: `users/{upn}/drive`
    User(String),
    /// Any drive by id: `drives/{id}`
    Drive(String),
    /// A SharePoint document library: `sites/{site}/drives/{drive}`
    Site { site_id: String, drive_id: String },
}

impl DriveLocator {
    pub fn for_source(source: &SourceConfig) -> Result<Self> {
        if let Some(drive_id) = &source.drive_id {
            return Ok(DriveLocator::Drive(drive_id.clone()));
        }
        match &source.user_principal_name {
            Some(upn) => Ok(DriveLocator::User(upn.clone())),
            None => Err(MigratorError::Config(
                "source.user_principal_name or source.drive_id is required".to_string(),
            )),
        }
    }

    pub fn for_destination(destination: &DestinationConfig) -> Self {
        DriveLocator::Site {
            site_id: destination.site_id.clone(),
            drive_id: destination.drive_id.clone(),
        }
    }

    fn segment(&self) -> String {
        match self {
            DriveLocator::User(upn) => format!("users/{}/drive", upn),
            DriveLocator::Drive(id) => format!("drives/{}", id),
            DriveLocator::Site { site_id, drive_id } => {
                format!("sites/{}/drives/{}", site_id, drive_id)
            }
        }
    }
}

/// Percent-encode each segment of a slash-separated path
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| utf8_percent_encode(s, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// One drive reached through Graph
pub struct GraphDrive {
    http: reqwest::Client,
    auth: Arc<GraphAuthenticator>,
    drive_url: String,
    timeout: Duration,
}

impl GraphDrive {
    pub fn new(
        http: reqwest::Client,
        auth: Arc<GraphAuthenticator>,
        base_url: &str,
        locator: &DriveLocator,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            auth,
            drive_url: format!("{}/{}", base_url.trim_end_matches('/'), locator.segment()),
            timeout,
        }
    }

    /// Build the source and destination drives sharing one HTTP client and token
    pub fn pair_from_config(config: &Config) -> Result<(Self, Self)> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.transfer.timeout())
            .user_agent(concat!("drive-migrator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let auth = Arc::new(GraphAuthenticator::new(http.clone(), &config.auth));
        let base = &config.auth.graph_base_url;
        let timeout = config.transfer.timeout();

        let source = GraphDrive::new(
            http.clone(),
            Arc::clone(&auth),
            base,
            &DriveLocator::for_source(&config.source)?,
            timeout,
        );
        let destination = GraphDrive::new(
            http,
            auth,
            base,
            &DriveLocator::for_destination(&config.destination),
            timeout,
        );
        Ok((source, destination))
    }

    /// `{drive}/root` or `{drive}/root:/{path}`
    fn item_url(&self, path: &str) -> String {
        let encoded = encode_path(path);
        if encoded.is_empty() {
            format!("{}/root", self.drive_url)
        } else {
            format!("{}/root:/{}", self.drive_url, encoded)
        }
    }

    /// `{drive}/root/{action}` or `{drive}/root:/{path}:/{action}`
    fn item_action_url(&self, path: &str, action: &str) -> String {
        let encoded = encode_path(path);
        if encoded.is_empty() {
            format!("{}/root/{}", self.drive_url, action)
        } else {
            format!("{}/root:/{}:/{}", self.drive_url, encoded, action)
        }
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.auth.access_token().await?;
        Ok(builder.bearer_auth(token))
    }

    async fn into_stream(response: Response) -> Result<ByteStream> {
        let response = check(response).await?;
        Ok(response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed())
    }
}

/// Turn a non-success response into [`MigratorError::Api`]
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MigratorError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RemoteDrive for GraphDrive {
    async fn list_children(&self, folder: &str) -> Result<Vec<DriveItem>> {
        let url = self.item_action_url(folder, "children");
        debug!("GET {}", url);

        let request = self.authorized(self.http.get(&url).timeout(self.timeout)).await?;
        let response = check(request.send().await?).await?;
        let page: ChildrenPage = response.json().await?;
        if page.next_link.is_some() {
            warn!("Listing of '{}' has further pages that are not followed", folder);
        }
        Ok(page.value)
    }

    async fn open_download(&self, remote_id: Option<&str>, path: &str) -> Result<ByteStream> {
        match remote_id {
            Some(id) => {
                let url = format!(
                    "{}/items/{}",
                    self.drive_url,
                    utf8_percent_encode(id, PATH_SEGMENT)
                );
                let request = self.authorized(self.http.get(&url).timeout(self.timeout)).await?;
                let item: DriveItem = check(request.send().await?).await?.json().await?;

                let download_url = item.download_url.ok_or_else(|| {
                    MigratorError::Transfer(format!("no download URL for {}", path))
                })?;
                // Pre-authenticated; no bearer token and no total timeout on the body
                let response = self.http.get(&download_url).send().await?;
                Self::into_stream(response).await
            }
            None => {
                let url = self.item_action_url(path, "content");
                let request = self.authorized(self.http.get(&url)).await?;
                Self::into_stream(request.send().await?).await
            }
        }
    }

    async fn item_exists(&self, path: &str) -> Result<bool> {
        let url = self.item_url(path);
        let request = self.authorized(self.http.get(&url).timeout(self.timeout)).await?;
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<()> {
        let url = self.item_action_url(parent, "children");
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let request = self
            .authorized(self.http.post(&url).timeout(self.timeout).json(&body))
            .await?;
        let response = request.send().await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Folder already exists: {}/{}", parent, name);
            return Ok(());
        }
        check(response).await?;
        info!("Created folder: {}/{}", parent, name);
        Ok(())
    }

    async fn put_content(&self, path: &str, body: ByteStream) -> Result<()> {
        let url = self.item_action_url(path, "content");
        // No declared length: the body is sent chunked and never cut short
        let request = self
            .authorized(self.http.put(&url).body(reqwest::Body::wrap_stream(body)))
            .await?;
        check(request.send().await?).await?;
        Ok(())
    }

    async fn create_upload_session(&self, path: &str, name: &str) -> Result<UploadSession> {
        let url = self.item_action_url(path, "createUploadSession");
        let body = serde_json::json!({
            "item": {
                "@microsoft.graph.conflictBehavior": "replace",
                "name": name,
            }
        });

        let request = self
            .authorized(self.http.post(&url).timeout(self.timeout).json(&body))
            .await?;
        let session: UploadSession = check(request.send().await?).await?.json().await?;
        Ok(session)
    }

    async fn upload_chunk(&self, session: &UploadSession, range: ByteRange, chunk: Bytes) -> Result<()> {
        // The session URL carries its own authorization
        let response = self
            .http
            .put(&session.upload_url)
            .header(CONTENT_RANGE, range.content_range())
            .header(CONTENT_LENGTH, chunk.len())
            .body(chunk)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    fn drive(locator: DriveLocator) -> GraphDrive {
        let http = reqwest::Client::new();
        let auth = Arc::new(GraphAuthenticator::new(http.clone(), &AuthConfig::default()));
        GraphDrive::new(
            http,
            auth,
            "https://graph.microsoft.com/v1.0/",
            &locator,
            Duration::from_secs(10),
        )
    }

    /// Accept one request, reply 201 and return (head, decoded body)
    async fn serve_one_put(listener: tokio::net::TcpListener) -> (String, Vec<u8>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            raw.extend_from_slice(&buf[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        while !raw.ends_with(b"0\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the last chunk");
            raw.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}")
            .await
            .unwrap();

        let head = String::from_utf8_lossy(&raw[..head_end]).to_lowercase();
        let mut body = Vec::new();
        let mut rest = &raw[head_end..];
        loop {
            let line_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
            let len = usize::from_str_radix(std::str::from_utf8(&rest[..line_end]).unwrap().trim(), 16)
                .unwrap();
            if len == 0 {
                break;
            }
            body.extend_from_slice(&rest[line_end + 2..line_end + 2 + len]);
            rest = &rest[line_end + 2 + len + 2..];
        }
        (head, body)
    }

    #[tokio::test]
    async fn test_put_content_streams_whole_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1.0", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_one_put(listener));

        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let auth = Arc::new(GraphAuthenticator::with_token(http.clone(), "tok"));
        let drive = GraphDrive::new(
            http,
            auth,
            &base,
            &DriveLocator::Drive("d1".to_string()),
            Duration::from_secs(10),
        );

        let pieces: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from(vec![7u8; 10])), Ok(Bytes::from(vec![8u8; 15]))];
        drive
            .put_content("Dst/a.txt", futures_util::stream::iter(pieces).boxed())
            .await
            .unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("put /v1.0/drives/d1/root:/dst/a.txt:/content"));
        assert!(head.contains("authorization: bearer tok"));
        assert!(head.contains("transfer-encoding: chunked"));
        assert!(!head.contains("content-length"));
        assert_eq!(body.len(), 25);
        assert_eq!(&body[10..], &[8u8; 15][..]);
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("TEST-Onedrive/a b/c#1.txt"), "TEST-Onedrive/a%20b/c%231.txt");
        assert_eq!(encode_path("/lead/trail/"), "lead/trail");
        assert_eq!(encode_path("資料/報告.pdf"), "%E8%B3%87%E6%96%99/%E5%A0%B1%E5%91%8A.pdf");
    }

    #[test]
    fn test_locator_segments() {
        let user = drive(DriveLocator::User("user@contoso.com".to_string()));
        assert_eq!(
            user.item_action_url("", "children"),
            "https://graph.microsoft.com/v1.0/users/user@contoso.com/drive/root/children"
        );

        let site = drive(DriveLocator::Site {
            site_id: "s1".to_string(),
            drive_id: "d1".to_string(),
        });
        assert_eq!(
            site.item_action_url("Lib/sub dir", "children"),
            "https://graph.microsoft.com/v1.0/sites/s1/drives/d1/root:/Lib/sub%20dir:/children"
        );
        assert_eq!(
            site.item_action_url("Lib/a.bin", "createUploadSession"),
            "https://graph.microsoft.com/v1.0/sites/s1/drives/d1/root:/Lib/a.bin:/createUploadSession"
        );
        assert_eq!(
            site.item_url("Lib/a.bin"),
            "https://graph.microsoft.com/v1.0/sites/s1/drives/d1/root:/Lib/a.bin"
        );
    }

    #[test]
    fn test_source_locator_prefers_drive_id() {
        let mut source = SourceConfig {
            user_principal_name: Some("u@x".to_string()),
            drive_id: Some("b!xyz".to_string()),
            root: "Root".to_string(),
        };
        assert_eq!(
            DriveLocator::for_source(&source).unwrap(),
            DriveLocator::Drive("b!xyz".to_string())
        );

        source.drive_id = None;
        assert_eq!(
            DriveLocator::for_source(&source).unwrap(),
            DriveLocator::User("u@x".to_string())
        );

        source.user_principal_name = None;
        assert!(DriveLocator::for_source(&source).is_err());
    }
}
