// src/s3_utils.rs
//
// Публичные URL для S3-совместимого хранилища и архивация сгенерированного
// медиа: результат инференса скачивается и перекладывается в наш бакет.

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

pub fn build_public_url(base: &str, bucket: &str, key: &str) -> String {
    let trimmed = base.trim_end_matches('/');

    // Простейший шаблон: https://host/{bucket}/{key} или https://bucket.host/{key}
    if trimmed.contains("{bucket}") || trimmed.contains("{key}") {
        return trimmed.replace("{bucket}", bucket).replace("{key}", key);
    }

    // База уже содержит бакет — добавляем только ключ.
    if trimmed.contains(bucket) {
        format!("{}/{}", trimmed, key)
    } else {
        format!("{}/{}/{}", trimmed, bucket, key)
    }
}

/// Скачивает результат по URL и кладёт в бакет, возвращает публичный URL.
/// MOCK_S3=true отдаёт исходный URL как есть (локальная разработка без AWS).
pub async fn archive_media(
    s3_client: &S3Client,
    bucket: &str,
    public_base_url: &str,
    source_url: &str,
    key: &str,
    content_type: &str,
) -> Result<String, String> {
    if std::env::var("MOCK_S3").unwrap_or_default() == "true" {
        return Ok(source_url.to_string());
    }

    let resp = reqwest::Client::new()
        .get(source_url)
        .send()
        .await
        .map_err(|e| format!("media download request error: {e}"))?;

    if !resp.status().is_success() {
        return Err(format!("media download failed status={}", resp.status()));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| format!("media download bytes error: {e}"))?;

    s3_client
        .put_object()
        .bucket(bucket)
        .key(key)
        .content_type(content_type)
        .body(ByteStream::from(bytes))
        .send()
        .await
        .map_err(|e| format!("s3 upload failed: {e}"))?;

    Ok(build_public_url(public_base_url, bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_templates_and_fallbacks() {
        assert_eq!(
            build_public_url("https://cdn.example.com/{bucket}/{key}", "media", "img/1.png"),
            "https://cdn.example.com/media/img/1.png"
        );
        assert_eq!(
            build_public_url("https://media.s3.amazonaws.com/", "media", "img/1.png"),
            "https://media.s3.amazonaws.com/img/1.png"
        );
        assert_eq!(
            build_public_url("https://s3.amazonaws.com", "media", "img/1.png"),
            "https://s3.amazonaws.com/media/img/1.png"
        );
    }
}
