//! イメージ参照の組み立てと検証

use crate::error::{BuildError, BuildResult};

/// レジストリとネームスペースを含む完全なイメージ参照を組み立てる
///
/// # Examples
/// - `("b", "ns", "")` -> `ns/b`
/// - `("b", "ns", "reg.io")` -> `reg.io/ns/b`
/// - `("reg.io/ns/b", "ns", "reg.io")` -> `reg.io/ns/b`
pub fn compile_tag(raw_tag: &str, namespace: &str, registry_address: &str) -> String {
    let raw_tag = raw_tag.trim();
    let namespace = namespace.trim().trim_matches('/');
    let registry = registry_address.trim().trim_end_matches('/');

    // すでにパスを含む場合はネームスペース付きとみなす
    let mut tag = if raw_tag.contains('/') || namespace.is_empty() {
        raw_tag.to_string()
    } else {
        format!("{}/{}", namespace, raw_tag)
    };

    let tag_lower = tag.to_lowercase();
    let registry = registry.to_lowercase();
    if !registry.is_empty() && !tag_lower.starts_with(&format!("{}/", registry)) {
        tag = format!("{}/{}", registry, tag);
    }

    tag.to_lowercase()
}

/// イメージ名とタグを分離
///
/// 最後の `:` より後ろに `/` を含まなければタグとみなす。
/// ダイジェスト参照（`name@sha256:...`）はタグを持たないため、全体と空のタグを返す。
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
/// - `reg.io/ns/job:42` -> `("reg.io/ns/job", "42")`
/// - `flink@sha256:abcd` -> `("flink@sha256:abcd", "")`
pub fn split_image_tag(image: &str) -> (String, String) {
    if split_digest(image).is_some() {
        return (image.to_string(), String::new());
    }

    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        // `/` を含むならレジストリのポート番号
        if !potential_tag.contains('/') {
            return (image[..pos].to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}

/// ダイジェスト参照をリポジトリとダイジェストに分離
///
/// `flink@sha256:abcd` -> `Some(("flink", "sha256:abcd"))`
pub fn split_digest(image: &str) -> Option<(&str, &str)> {
    image
        .split_once('@')
        .filter(|(repo, digest)| !repo.is_empty() && !digest.is_empty())
}

/// タグのバリデーション
///
/// Docker タグの制約:
/// - 128文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
pub fn validate_tag(tag: &str) -> BuildResult<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > 128 {
        return Err(BuildError::InvalidTag {
            tag: format!("Tag too long ({} characters, max 128)", tag.len()),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(BuildError::InvalidTag {
            tag: format!("Invalid character '{}' in tag: {}", c, tag),
        });
    }

    Ok(())
}
