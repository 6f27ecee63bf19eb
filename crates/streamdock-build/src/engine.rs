//! コンテナエンジンとの接続
//!
//! [`ContainerConnector`] / [`ContainerClient`] がセッションとエンジンの境界。
//! Docker 実装では各操作のストリームを専用タスクで読み進め、進捗イベントを
//! シンクに流しつつ、終端の結果を oneshot で呼び出し側に返す。

use crate::context::ContextBuilder;
use crate::progress::{EventSink, ProgressEvent, parse_build_step};
use crate::tag::split_image_tag;
use anyhow::{Context as _, anyhow};
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{BuildInfo, CreateImageInfo, ProgressDetail, PushImageInfo};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http_body_util::{Either, Full};
use std::future::Future;
use std::path::Path;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// エンジンへの接続を作るもの
#[allow(async_fn_in_trait)]
pub trait ContainerConnector {
    type Client: ContainerClient;

    async fn connect(&self) -> anyhow::Result<Self::Client>;
}

/// エンジンのクライアント
///
/// 各操作は終端イベントが届くまで完了しない。進捗イベントはエンジン側の
/// 実行コンテキストから `events` に渡される。クライアントを drop すると接続が解放される。
#[allow(async_fn_in_trait)]
pub trait ContainerClient {
    async fn pull(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
        events: EventSink,
    ) -> anyhow::Result<()>;

    /// イメージをビルドしてイメージ ID を返す
    async fn build(
        &self,
        context_dir: &Path,
        manifest_path: &Path,
        tags: &[String],
        events: EventSink,
    ) -> anyhow::Result<String>;

    async fn push(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
        events: EventSink,
    ) -> anyhow::Result<()>;
}

/// ローカルの Docker デーモンへ接続する
#[derive(Debug, Clone, Default)]
pub struct DockerConnector;

impl ContainerConnector for DockerConnector {
    type Client = DockerClient;

    async fn connect(&self) -> anyhow::Result<DockerClient> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to the Docker daemon")?;
        docker
            .ping()
            .await
            .context("Docker daemon did not respond to ping")?;
        tracing::debug!("Connected to Docker daemon");
        Ok(DockerClient { docker })
    }
}

pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn image_id(&self, tag: &str) -> anyhow::Result<String> {
        let info = self
            .docker
            .inspect_image(tag)
            .await
            .with_context(|| format!("Failed to inspect built image {}", tag))?;
        info.id
            .ok_or_else(|| anyhow!("Image {} has no id", tag))
    }
}

fn layer_event(
    id: Option<String>,
    status: Option<String>,
    detail: Option<ProgressDetail>,
) -> Option<ProgressEvent> {
    let status = status?;
    match (id, detail) {
        (Some(id), Some(detail)) => Some(ProgressEvent::Layer {
            id,
            status,
            current: detail.current.unwrap_or(0).max(0) as u64,
            total: detail.total.unwrap_or(0).max(0) as u64,
        }),
        (Some(id), None) => Some(ProgressEvent::Layer {
            id,
            status,
            current: 0,
            total: 0,
        }),
        (None, _) => Some(ProgressEvent::Status(status)),
    }
}

fn pull_event(info: CreateImageInfo) -> Result<Option<ProgressEvent>, String> {
    if let Some(error) = info.error {
        return Err(error);
    }
    Ok(layer_event(info.id, info.status, info.progress_detail))
}

fn push_event(info: PushImageInfo) -> Result<Option<ProgressEvent>, String> {
    if let Some(error) = info.error {
        return Err(error);
    }
    Ok(layer_event(None, info.status, info.progress_detail))
}

/// ビルド出力の処理
///
/// `Ok(Some(id))` はイメージ ID を含む aux レコード
fn build_output(info: BuildInfo, events: &EventSink) -> Result<Option<String>, String> {
    if let Some(error) = info.error {
        return Err(error);
    }

    if let Some(error_detail) = info.error_detail {
        return Err(error_detail
            .message
            .unwrap_or_else(|| "Unknown build error".to_string()));
    }

    if let Some(stream) = info.stream {
        tracing::debug!(target: "streamdock::engine::build", "{}", stream.trim_end());
        if let Some(event) = parse_build_step(&stream) {
            events(event);
        }
    }

    if let Some(status) = info.status {
        events(ProgressEvent::Status(status));
    }

    Ok(info.aux.and_then(|aux| aux.id))
}

/// ストリームを読むタスクのハンドル
///
/// drop されるとタスクを中断し、エンジンのストリームも閉じる。
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// ストリームを終端まで読み進める
///
/// `on_item` が最後に返した値が結果になる。エラーを受け取った時点で打ち切る。
async fn forward<S, I, T, F>(stream: S, mut on_item: F) -> Result<Option<T>, String>
where
    S: Stream<Item = Result<I, bollard::errors::Error>>,
    F: FnMut(I) -> Result<Option<T>, String>,
{
    let mut stream = std::pin::pin!(stream);
    let mut outcome = None;
    while let Some(item) = stream.next().await {
        if let Some(value) = item.map_err(|e| e.to_string()).and_then(&mut on_item)? {
            outcome = Some(value);
        }
    }
    Ok(outcome)
}

impl DockerClient {
    /// 専用タスクで `run` を実行し、その結果を待つ
    async fn on_callback_task<T, Fut>(
        &self,
        what: &str,
        run: impl FnOnce(Docker) -> Fut,
    ) -> anyhow::Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let task = run(self.docker.clone());
        let _guard = TaskGuard(tokio::spawn(async move {
            done_tx.send(task.await).ok();
        }));

        done_rx
            .await
            .with_context(|| format!("{} task ended without a result", what))?
            .map_err(|e| anyhow!(e))
    }
}

impl ContainerClient for DockerClient {
    async fn pull(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
        events: EventSink,
    ) -> anyhow::Result<()> {
        // ダイジェスト参照はタグなしで全体をそのまま渡す
        let (from_image, tag) = split_image_tag(image);

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        self.on_callback_task("Pull", move |docker| async move {
            #[allow(deprecated)]
            let stream = docker.create_image(Some(options), None, credentials);
            forward(stream, |info| {
                if let Some(event) = pull_event(info)? {
                    events(event);
                }
                Ok(None::<()>)
            })
            .await
            .map(|_| ())
        })
        .await
    }

    async fn build(
        &self,
        context_dir: &Path,
        manifest_path: &Path,
        tags: &[String],
        events: EventSink,
    ) -> anyhow::Result<String> {
        let (first_tag, extra_tags) = tags
            .split_first()
            .ok_or_else(|| anyhow!("At least one tag is required to build an image"))?;

        let context_data = ContextBuilder::create_context(context_dir, manifest_path)?;

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: first_tag.clone(),
            rm: true,      // 中間コンテナを削除
            forcerm: true, // ビルド失敗時も中間コンテナを削除
            ..Default::default()
        };
        let body = Full::new(Bytes::from(context_data));

        let built = self
            .on_callback_task("Build", move |docker| async move {
                #[allow(deprecated)]
                let stream = docker.build_image(options, None, Some(Either::Left(body)));
                forward(stream, |info| build_output(info, &events)).await
            })
            .await?;

        let image_id = match built {
            Some(id) => id,
            None => self.image_id(first_tag).await?,
        };

        for tag in extra_tags {
            let (repo, tag) = split_image_tag(tag);
            #[allow(deprecated)]
            let options = bollard::image::TagImageOptions { repo, tag };
            #[allow(deprecated)]
            let tagged = self.docker.tag_image(&image_id, Some(options));
            tagged
                .await
                .with_context(|| format!("Failed to tag image {}", image_id))?;
        }

        tracing::info!("Successfully built: {} ({})", first_tag, image_id);
        Ok(image_id)
    }

    async fn push(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
        events: EventSink,
    ) -> anyhow::Result<()> {
        let (image_name, tag) = split_image_tag(image);

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag };

        self.on_callback_task("Push", move |docker| async move {
            #[allow(deprecated)]
            let stream = docker.push_image(&image_name, Some(options), credentials);
            forward(stream, |info| {
                if let Some(event) = push_event(info)? {
                    events(event);
                }
                Ok(None::<()>)
            })
            .await
            .map(|_| ())
        })
        .await
    }
}
