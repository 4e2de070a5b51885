// src/inference.rs
//
// Клиент генеративного бэкенда: чат отвечает синхронно, медиа (image/video/
// character) идёт через задачу с поллингом статуса. Ожидание ограничено
// сверху: по таймауту задача считается проваленной, монеты не списываются.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};

#[derive(Debug)]
pub enum InferenceError {
    Http(reqwest::Error),
    Api { status: u16, body: String },
    InvalidResponse(String),
    TaskFailed(String),
    Timeout,
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::Http(e) => write!(f, "http error: {e}"),
            InferenceError::Api { status, body } => {
                write!(f, "inference api error status={status} body={body}")
            }
            InferenceError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            InferenceError::TaskFailed(reason) => write!(f, "task failed: {reason}"),
            InferenceError::Timeout => write!(f, "task did not finish in time"),
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MediaKind {
    Image,
    Video,
    Character,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Character => "character",
        }
    }

    fn model(self) -> &'static str {
        match self {
            MediaKind::Image => "companion-image-v1",
            MediaKind::Video => "companion-video-v1",
            MediaKind::Character => "companion-avatar-v1",
        }
    }
}

#[derive(Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl InferenceClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, InferenceError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(InferenceError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text)
            .map_err(|e| InferenceError::InvalidResponse(format!("{e}; body={text}")))
    }

    pub async fn generate_chat(
        &self,
        character_prompt: Option<&str>,
        message: &str,
    ) -> Result<String, InferenceError> {
        let body = json!({
            "model": "companion-chat-v1",
            "system": character_prompt,
            "message": message,
        });

        let resp = self.post_json("/v1/chat", &body).await?;
        resp.get("reply")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| InferenceError::InvalidResponse("chat response without reply".to_string()))
    }

    pub async fn start_media_task(
        &self,
        kind: MediaKind,
        prompt: &str,
    ) -> Result<String, InferenceError> {
        let body = json!({
            "model": kind.model(),
            "input": { "prompt": prompt },
        });

        let resp = self.post_json("/v1/tasks", &body).await?;
        resp["data"]["taskId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| InferenceError::InvalidResponse("no taskId in response".to_string()))
    }

    async fn task_status(&self, task_id: &str) -> Result<Value, InferenceError> {
        let resp = self
            .http
            .get(format!("{}/v1/tasks/{task_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(InferenceError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text)
            .map_err(|e| InferenceError::InvalidResponse(format!("{e}; body={text}")))
    }

    /// Ждёт завершения задачи, возвращает URL результата.
    pub async fn wait_for_media(
        &self,
        task_id: &str,
        poll_interval_secs: u64,
        max_wait_secs: u64,
    ) -> Result<String, InferenceError> {
        let poll_interval = poll_interval_secs.max(1);
        let mut waited = 0u64;

        loop {
            let status = self.task_status(task_id).await?;
            match status["data"]["state"].as_str() {
                Some("success") => {
                    return status["data"]["resultUrl"]
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| {
                            InferenceError::InvalidResponse(
                                "finished task without resultUrl".to_string(),
                            )
                        });
                }
                Some("failed") => {
                    let reason = status["data"]["failReason"]
                        .as_str()
                        .unwrap_or("unknown")
                        .to_string();
                    return Err(InferenceError::TaskFailed(reason));
                }
                _ => {}
            }

            if waited >= max_wait_secs {
                log::warn!("inference task timed out, task_id={task_id} waited={waited}s");
                return Err(InferenceError::Timeout);
            }
            tokio::time::sleep(Duration::from_secs(poll_interval)).await;
            waited += poll_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    // Однострочный HTTP-стаб: каждый коннект получает один и тот же ответ.
    fn spawn_stub(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    fn client(base: String) -> InferenceClient {
        InferenceClient::new(base, "test-key".to_string())
    }

    #[tokio::test]
    async fn wait_for_media_returns_result_url() {
        let base = spawn_stub(r#"{"data":{"state":"success","resultUrl":"https://cdn.example.com/x.png"}}"#);
        let url = client(base).wait_for_media("task_1", 1, 10).await.unwrap();
        assert_eq!(url, "https://cdn.example.com/x.png");
    }

    #[tokio::test]
    async fn wait_for_media_surfaces_task_failure() {
        let base = spawn_stub(r#"{"data":{"state":"failed","failReason":"content filter"}}"#);
        let err = client(base).wait_for_media("task_1", 1, 10).await.unwrap_err();
        assert!(matches!(err, InferenceError::TaskFailed(reason) if reason == "content filter"));
    }

    #[tokio::test]
    async fn wait_for_media_times_out_on_stuck_task() {
        // max_wait 0: один опрос, состояние всё ещё processing -> Timeout.
        let base = spawn_stub(r#"{"data":{"state":"processing"}}"#);
        let err = client(base).wait_for_media("task_1", 1, 0).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout));
    }
}
