// Coordinator HTTP Client
// JSON over HTTP implementation of the coordinator RPC surface

use crate::coordinator::models::{Context, Filter, Line, Stage, Step};
use crate::coordinator::{Client, ClientError};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

const TOKEN_HEADER: &str = "X-Drone-Token";
const WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Talks to the coordinator at `endpoint` (`proto://host`)
#[derive(Debug, Clone)]
pub struct HttpClient {
    endpoint: String,
    secret: String,
    client: reqwest::Client,
    dump: bool,
    dump_body: bool,
}

impl HttpClient {
    pub fn new(
        endpoint: impl Into<String>,
        secret: impl Into<String>,
        skip_verify: bool,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_verify)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
            client,
            dump: false,
            dump_body: false,
        })
    }

    /// Log requests and responses at debug level
    pub fn with_dump(mut self, dump: bool, body: bool) -> Self {
        self.dump = dump;
        self.dump_body = body;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<(StatusCode, String), ClientError> {
        let url = self.url(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(TOKEN_HEADER, &self.secret);
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Transport(format!("timeout: {}", e))
            } else {
                ClientError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if self.dump {
            if self.dump_body {
                tracing::debug!(%method, %url, status = status.as_u16(), body = %text, "coordinator request");
            } else {
                tracing::debug!(%method, %url, status = status.as_u16(), "coordinator request");
            }
        }

        if status.is_client_error() || status.is_server_error() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }
        Ok((status, text))
    }

    async fn call<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (_, text) = self.send(method, path, body, None).await?;
        decode(&text)
    }
}

fn decode<R: DeserializeOwned>(text: &str) -> Result<R, ClientError> {
    serde_json::from_str(text).map_err(|e| ClientError::Decode(e.to_string()))
}

#[async_trait]
impl Client for HttpClient {
    async fn ping(&self) -> Result<(), ClientError> {
        self.send::<()>(Method::GET, "/rpc/v2/ping", None, None).await?;
        Ok(())
    }

    async fn request(&self, filter: &Filter) -> Result<Option<Stage>, ClientError> {
        let (status, text) = self
            .send(Method::POST, "/rpc/v2/stage", Some(filter), None)
            .await?;
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        let stage: Stage = decode(&text)?;
        Ok((stage.id != 0).then_some(stage))
    }

    async fn accept(&self, stage: &mut Stage) -> Result<(), ClientError> {
        let path = format!("/rpc/v2/stage/{}?machine={}", stage.id, stage.machine);
        match self.call::<(), Stage>(Method::POST, &path, None).await {
            Ok(accepted) => {
                *stage = accepted;
                Ok(())
            }
            Err(ClientError::Http { status: 409, .. }) => Err(ClientError::OptimisticLock),
            Err(err) => Err(err),
        }
    }

    async fn detail(&self, stage: &Stage) -> Result<Context, ClientError> {
        let path = format!("/rpc/v2/stage/{}", stage.id);
        self.call::<(), Context>(Method::GET, &path, None).await
    }

    async fn update(&self, stage: &mut Stage) -> Result<(), ClientError> {
        let path = format!("/rpc/v2/stage/{}", stage.id);
        let updated: Stage = self.call(Method::PUT, &path, Some(&*stage)).await?;
        *stage = updated;
        Ok(())
    }

    async fn update_step(&self, step: &mut Step) -> Result<(), ClientError> {
        let path = format!("/rpc/v2/step/{}", step.id);
        let updated: Step = self.call(Method::PUT, &path, Some(&*step)).await?;
        *step = updated;
        Ok(())
    }

    async fn watch(&self, build_id: i64) -> Result<bool, ClientError> {
        let path = format!("/rpc/v2/build/{}/watch", build_id);
        loop {
            match self
                .send::<()>(Method::POST, &path, None, Some(WATCH_TIMEOUT))
                .await
            {
                Ok((StatusCode::NO_CONTENT, _)) => continue,
                Ok((_, text)) => {
                    let done: bool = decode(&text).unwrap_or(true);
                    if done {
                        return Ok(true);
                    }
                }
                Err(ClientError::Transport(message)) if message.starts_with("timeout") => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn batch(&self, step_id: i64, lines: &[Line]) -> Result<(), ClientError> {
        let path = format!("/rpc/v2/step/{}/logs/batch", step_id);
        self.send(Method::POST, &path, Some(lines), None).await?;
        Ok(())
    }

    async fn upload(&self, step_id: i64, lines: &[Line]) -> Result<(), ClientError> {
        let path = format!("/rpc/v2/step/{}/logs/upload", step_id);
        self.send(Method::POST, &path, Some(lines), None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trailing_slash() {
        let client = HttpClient::new("https://ci.example.com/", "secret", false).unwrap();
        assert_eq!(client.url("/rpc/v2/ping"), "https://ci.example.com/rpc/v2/ping");
    }

    #[test]
    fn test_decode_error() {
        let result: Result<Stage, _> = decode("not json");
        assert!(matches!(result, Err(ClientError::Decode(_))));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ClientError::Transport("reset".to_string()).is_transient());
        assert!(ClientError::Http { status: 502, body: String::new() }.is_transient());
        assert!(!ClientError::Http { status: 404, body: String::new() }.is_transient());
        assert!(!ClientError::OptimisticLock.is_transient());
    }
}
