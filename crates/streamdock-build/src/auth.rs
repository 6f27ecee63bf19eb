//! レジストリ認証処理
//!
//! 設定されたレジストリ宛てのイメージにだけ認証情報を付与する。
//! ベースイメージが第三者のレジストリを指していても、認証情報はそちらに送られない。

use crate::error::{BuildError, BuildResult};
use crate::request::RegistryConfig;
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Docker config.json の構造
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
}

/// credential helper からのレスポンス
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// 設定済みレジストリの認証情報
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    address: String,
    username: Option<String>,
    password: Option<String>,
    config_path: PathBuf,
}

impl RegistryAuth {
    /// リクエストのレジストリ設定から作成
    ///
    /// ユーザー名・パスワードがない場合は ~/.docker/config.json を参照する
    pub fn new(registry: &RegistryConfig) -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self {
            address: registry.address.trim().trim_end_matches('/').to_lowercase(),
            username: registry.username.clone(),
            password: registry.password.clone(),
            config_path,
        }
    }

    /// 指定したパスの config.json を使用
    pub fn with_config_path(mut self, config_path: PathBuf) -> Self {
        self.config_path = config_path;
        self
    }

    /// イメージが設定済みレジストリ宛てかどうか
    pub fn targets_configured_registry(&self, image: &str) -> bool {
        !self.address.is_empty() && extract_registry(image).to_lowercase() == self.address
    }

    /// イメージ名に対して付与する認証情報を取得
    ///
    /// # Returns
    /// * `Ok(Some(credentials))` - 設定済みレジストリ宛てで認証情報が見つかった場合
    /// * `Ok(None)` - 別レジストリ宛て、または認証情報がない場合
    /// * `Err(e)` - 認証情報の取得に失敗した場合
    pub fn credentials_for(&self, image: &str) -> BuildResult<Option<DockerCredentials>> {
        if !self.targets_configured_registry(image) {
            tracing::debug!(image, "Image is not hosted on the configured registry, no credentials attached");
            return Ok(None);
        }

        if let Some(username) = &self.username {
            return Ok(Some(DockerCredentials {
                username: Some(username.clone()),
                password: self.password.clone(),
                serveraddress: Some(self.address.clone()),
                ..Default::default()
            }));
        }

        self.lookup_docker_config()
    }

    /// config.json から設定済みレジストリの認証情報を探す
    fn lookup_docker_config(&self) -> BuildResult<Option<DockerCredentials>> {
        // config.json が存在しない場合は認証なしで続行
        if !self.config_path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", self.config_path);
            return Ok(None);
        }

        let config = self.load_docker_config()?;

        if let Some(auth_entry) = config.auths.get(&self.address)
            && let Some(auth_b64) = &auth_entry.auth
            && let Some(creds) = self.decode_auth(auth_b64)?
        {
            tracing::debug!("Found credentials in auths for {}", self.address);
            return Ok(Some(creds));
        }

        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            if let Ok(Some(creds)) = self.get_from_helper(helper) {
                return Ok(Some(creds));
            }
        }

        tracing::debug!("No credentials found for {}", self.address);
        Ok(None)
    }

    fn load_docker_config(&self) -> BuildResult<DockerConfig> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.address.clone(),
                message: format!("Failed to read {}: {}", self.config_path.display(), e),
            })?;

        serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: self.address.clone(),
            message: format!("Failed to parse {}: {}", self.config_path.display(), e),
        })
    }

    fn decode_auth(&self, auth_b64: &str) -> BuildResult<Option<DockerCredentials>> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth_b64)
            .map_err(|e| BuildError::AuthFailed {
                registry: self.address.clone(),
                message: format!("Failed to decode auth: {}", e),
            })?;

        let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
            registry: self.address.clone(),
            message: format!("Invalid UTF-8 in auth: {}", e),
        })?;

        Ok(auth_str
            .split_once(':')
            .map(|(username, password)| DockerCredentials {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                serveraddress: Some(self.address.clone()),
                ..Default::default()
            }))
    }

    /// credential helper から認証情報を取得
    fn get_from_helper(&self, helper: &str) -> BuildResult<Option<DockerCredentials>> {
        let helper_cmd = format!("docker-credential-{}", helper);

        let mut child = Command::new(&helper_cmd)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::AuthFailed {
                registry: self.address.clone(),
                message: format!("Failed to run {}: {}", helper_cmd, e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.address.as_bytes()).ok();
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BuildError::AuthFailed {
                registry: self.address.clone(),
                message: format!("Credential helper failed: {}", e),
            })?;

        if !output.status.success() {
            tracing::debug!(
                "Credential helper returned error for {}: {}",
                self.address,
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }

        let response: CredentialResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
                registry: self.address.clone(),
                message: format!("Failed to parse credential helper response: {}", e),
            })?;

        Ok(Some(DockerCredentials {
            username: Some(response.username),
            password: Some(response.secret),
            serveraddress: Some(self.address.clone()),
            ..Default::default()
        }))
    }
}

/// イメージ名からレジストリを抽出
///
/// # Examples
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn extract_registry(image: &str) -> &str {
    if let Some((first, _)) = image.split_once('/')
        && (first.contains('.') || first.contains(':') || first == "localhost")
    {
        return first;
    }

    "docker.io"
}
