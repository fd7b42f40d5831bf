use async_nats::ServerAddr;
use futures::future::BoxFuture;
use futures::FutureExt;
use influx_line::BatchPoints;
use reqwest::{Client, RequestBuilder, StatusCode};
use thiserror::Error;
use tracing::info;

/// Downstream store a batch is written to.
///
/// Implementations must tolerate concurrent calls for distinct batches. A
/// failed write is not retried by the caller.
pub trait Sink: Send + Sync + 'static {
    fn write<'a>(&'a self, batch: &'a BatchPoints) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request; err={0}")]
    Request(#[from] reqwest::Error),
    #[error("Rejected by InfluxDB; status={status}; body={body}")]
    Rejected { status: StatusCode, body: String },
    #[error("Connect NATS; err={0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("Publish NATS; err={0}")]
    Publish(#[from] async_nats::PublishError),
}

/// Writes batches to the `InfluxDB` v1 HTTP API.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxSink {
    #[must_use]
    pub fn new(endpoint: &str, username: Option<String>, password: Option<String>) -> Self {
        InfluxSink {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    /// Ensures `database` exists; a no-op if it already does.
    ///
    /// # Errors
    ///
    /// Errors if the server is unreachable or rejects the query.
    pub async fn create_database(&self, database: &str) -> Result<(), SinkError> {
        let query = format!("CREATE DATABASE \"{}\"", database.replace('"', "\\\""));
        let request = self
            .client
            .post(format!("{}/query", self.endpoint))
            .query(&[("q", query.as_str())]);

        check_status(self.authenticate(request).send().await?).await?;
        info!(database, "Database ready");

        Ok(())
    }

    fn write_request(&self, batch: &BatchPoints) -> RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/write", self.endpoint))
            .query(&[("db", batch.database())]);
        if let Some(rp) = batch.retention_policy() {
            request = request.query(&[("rp", rp)]);
        }
        request = request.query(&[("precision", batch.precision().as_str())]);

        self.authenticate(request).body(batch.to_line_protocol())
    }

    fn authenticate(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(username) = &self.username {
            request = request.query(&[("u", username)]);
        }
        if let Some(password) = &self.password {
            request = request.query(&[("p", password)]);
        }

        request
    }
}

impl Sink for InfluxSink {
    fn write<'a>(&'a self, batch: &'a BatchPoints) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            let response = self.write_request(batch).send().await?;

            check_status(response).await
        }
        .boxed()
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();

    Err(SinkError::Rejected { status, body })
}

/// Publishes line-protocol encoded batches to NATS.
///
/// Each batch is one message on `{subject}.{database}`.
#[derive(Debug, Clone)]
pub struct NatsSink {
    client: async_nats::Client,
    subject: String,
}

impl NatsSink {
    /// Connects to the given servers.
    ///
    /// # Errors
    ///
    /// Errors if no connection can be established.
    pub async fn connect(
        servers: Vec<ServerAddr>,
        subject: impl Into<String>,
    ) -> Result<Self, SinkError> {
        let client = async_nats::connect(&servers).await?;

        Ok(NatsSink { client, subject: subject.into() })
    }

    fn batch_subject(&self, batch: &BatchPoints) -> String {
        format!("{}.{}", self.subject, batch.database())
    }
}

impl Sink for NatsSink {
    fn write<'a>(&'a self, batch: &'a BatchPoints) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            self.client
                .publish(self.batch_subject(batch), batch.to_line_protocol().into())
                .await?;

            Ok(())
        }
        .boxed()
    }
}


#[cfg(test)]
mod tests {
    use expect_test::expect;
    use influx_line::{BatchConfig, Precision};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    fn batch(retention_policy: Option<&str>, precision: Precision) -> BatchPoints {
        BatchPoints::new(BatchConfig {
            database: "mydb".to_string(),
            retention_policy: retention_policy.map(str::to_string),
            precision,
        })
        .unwrap()
    }

    fn write_url(sink: &InfluxSink, batch: &BatchPoints) -> String {
        sink.write_request(batch).build().unwrap().url().to_string()
    }

    /// Answers one request with `status` and `body`; yields the request line.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0; 1024];
            while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }

            let length = match body.is_empty() {
                true => String::new(),
                false => format!("content-length: {}\r\n", body.len()),
            };
            let response = format!("HTTP/1.1 {status}\r\n{length}connection: close\r\n\r\n{body}");
            stream.write_all(response.as_bytes()).await.unwrap();

            String::from_utf8_lossy(&head).lines().next().unwrap_or_default().to_string()
        });

        (endpoint, server)
    }

    #[test]
    fn write_url_basic() {
        let sink = InfluxSink::new("http://localhost:8086/", None, None);

        expect!["http://localhost:8086/write?db=mydb&precision=ns"]
            .assert_eq(&write_url(&sink, &batch(None, Precision::Nanoseconds)));
    }

    #[test]
    fn write_url_with_auth_and_retention_policy() {
        let sink = InfluxSink::new(
            "http://localhost:8086",
            Some("admin".to_string()),
            Some("secret".to_string()),
        );

        expect!["http://localhost:8086/write?db=mydb&rp=week&precision=s&u=admin&p=secret"]
            .assert_eq(&write_url(&sink, &batch(Some("week"), Precision::Seconds)));
    }

    #[test]
    fn write_url_encodes_credentials() {
        let sink = InfluxSink::new(
            "http://localhost:8086",
            Some("ad min".to_string()),
            Some("p&ss#word=1".to_string()),
        );

        expect!["http://localhost:8086/write?db=mydb&precision=s&u=ad+min&p=p%26ss%23word%3D1"]
            .assert_eq(&write_url(&sink, &batch(None, Precision::Seconds)));
    }

    #[tokio::test]
    async fn create_database_posts_query() {
        let (endpoint, server) = serve_once("204 No Content", "").await;
        let sink =
            InfluxSink::new(&endpoint, Some("admin".to_string()), Some("s&cret".to_string()));

        sink.create_database("mydb").await.unwrap();

        expect![[r#"POST /query?q=CREATE+DATABASE+%22mydb%22&u=admin&p=s%26cret HTTP/1.1"#]]
            .assert_eq(&server.await.unwrap());
    }

    #[tokio::test]
    async fn create_database_rejection_is_an_error() {
        let (endpoint, server) = serve_once("500 Internal Server Error", "boom").await;
        let sink = InfluxSink::new(&endpoint, None, None);

        let err = sink.create_database("mydb").await.unwrap_err();
        server.await.unwrap();

        match err {
            SinkError::Rejected { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_influx_is_an_error() {
        // Port 9 (discard) is closed on test hosts.
        let sink = InfluxSink::new("http://127.0.0.1:9", None, None);

        let err = sink.write(&batch(None, Precision::Seconds)).await.unwrap_err();

        assert!(matches!(err, SinkError::Request(_)), "{err}");
    }
}
