//! コンテナエンジンのセッション
//!
//! 接続の取得と解放をスコープに閉じ込め、下位のエラーをステップ単位のエラーに変換する。

use crate::auth::RegistryAuth;
use crate::engine::{ContainerClient, ContainerConnector};
use crate::error::StageError;
use crate::progress::PhaseTracker;
use crate::step::Step;
use crate::tag::{split_image_tag, validate_tag};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// セッション終了時に解放をログに残すガード
struct SessionGuard {
    step: Step,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        tracing::debug!(step = %self.step, "Container engine session released");
    }
}

pub struct ContainerSession<C> {
    connector: C,
    auth: RegistryAuth,
}

impl<C: ContainerConnector> ContainerSession<C> {
    pub fn new(connector: C, auth: RegistryAuth) -> Self {
        Self { connector, auth }
    }

    /// クライアントを取得して `body` を実行
    ///
    /// クライアントは `body` に所有権ごと渡され、成功・失敗・キャンセルの
    /// いずれでも `body` の終了とともに解放される。
    pub async fn with_session<T, F, Fut>(
        &self,
        step: Step,
        context: &str,
        body: F,
    ) -> Result<T, StageError>
    where
        F: FnOnce(C::Client) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let client = self.connector.connect().await.map_err(|e| {
            StageError::new(step, "could not connect to the container engine", e)
        })?;
        let _guard = SessionGuard { step };

        body(client)
            .await
            .map_err(|e| StageError::new(step, context, e))
    }

    /// ベースイメージを pull
    pub async fn pull(&self, image: &str, progress: &Arc<PhaseTracker>) -> Result<(), StageError> {
        let step = Step::PullBaseImage;
        let credentials = self
            .auth
            .credentials_for(image)
            .map_err(|e| StageError::new(step, format!("pull failed for image {}", image), e))?;
        let events = progress.sink();

        self.with_session(step, &format!("pull failed for image {}", image), |client| {
            async move { client.pull(image, credentials, events).await }
        })
        .await?;

        progress.finish();
        Ok(())
    }

    /// イメージをビルドしてイメージ ID を返す
    pub async fn build(
        &self,
        context_dir: &Path,
        manifest_path: &Path,
        tags: &[String],
        progress: &Arc<PhaseTracker>,
    ) -> Result<String, StageError> {
        let events = progress.sink();
        let context = format!("build failed for image {}", tags.join(", "));

        let image_id = self
            .with_session(Step::BuildImage, &context, |client| async move {
                client.build(context_dir, manifest_path, tags, events).await
            })
            .await?;

        progress.finish();
        Ok(image_id)
    }

    /// イメージをレジストリに push
    pub async fn push(&self, image: &str, progress: &Arc<PhaseTracker>) -> Result<(), StageError> {
        let step = Step::PushImage;
        let context = format!("push failed for image {}", image);

        let (_, tag) = split_image_tag(image);
        validate_tag(&tag).map_err(|e| StageError::new(step, context.as_str(), e))?;
        let credentials = self
            .auth
            .credentials_for(image)
            .map_err(|e| StageError::new(step, context.as_str(), e))?;
        if credentials.is_none() {
            tracing::warn!(image, "Pushing without registry credentials");
        }
        let events = progress.sink();

        self.with_session(step, &context, |client| async move {
            client.push(image, credentials, events).await
        })
        .await?;

        progress.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::NotificationDispatcher;
    use crate::progress::{EventSink, Phase, ProgressEvent, ProgressTracker};
    use crate::request::RegistryConfig;
    use bollard::auth::DockerCredentials;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        open: AtomicUsize,
        connects: AtomicUsize,
        credentials: Mutex<Vec<Option<String>>>,
    }

    struct FakeConnector {
        counters: Arc<Counters>,
        fail_with: Option<&'static str>,
    }

    struct FakeClient {
        counters: Arc<Counters>,
        fail_with: Option<&'static str>,
    }

    impl Drop for FakeClient {
        fn drop(&mut self) {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ContainerConnector for FakeConnector {
        type Client = FakeClient;

        async fn connect(&self) -> anyhow::Result<FakeClient> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            self.counters.open.fetch_add(1, Ordering::SeqCst);
            Ok(FakeClient {
                counters: self.counters.clone(),
                fail_with: self.fail_with,
            })
        }
    }

    impl FakeClient {
        fn emit(&self, events: &EventSink, credentials: Option<DockerCredentials>) -> anyhow::Result<()> {
            self.counters
                .credentials
                .lock()
                .unwrap()
                .push(credentials.and_then(|c| c.username));
            events(ProgressEvent::Layer {
                id: "layer".into(),
                status: "Downloading".into(),
                current: 5,
                total: 10,
            });
            match self.fail_with {
                Some(msg) => Err(anyhow::anyhow!(msg)),
                None => Ok(()),
            }
        }
    }

    impl ContainerClient for FakeClient {
        async fn pull(
            &self,
            _image: &str,
            credentials: Option<DockerCredentials>,
            events: EventSink,
        ) -> anyhow::Result<()> {
            self.emit(&events, credentials)
        }

        async fn build(
            &self,
            _context_dir: &Path,
            _manifest_path: &Path,
            _tags: &[String],
            events: EventSink,
        ) -> anyhow::Result<String> {
            self.emit(&events, None)?;
            Ok("sha256:feed".to_string())
        }

        async fn push(
            &self,
            _image: &str,
            credentials: Option<DockerCredentials>,
            events: EventSink,
        ) -> anyhow::Result<()> {
            self.emit(&events, credentials)
        }
    }

    fn session(fail_with: Option<&'static str>) -> (ContainerSession<FakeConnector>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let auth = RegistryAuth::new(&RegistryConfig {
            address: "reg.example.com".into(),
            namespace: "data".into(),
            username: Some("bot".into()),
            password: Some("pw".into()),
        });
        (
            ContainerSession::new(
                FakeConnector {
                    counters: counters.clone(),
                    fail_with,
                },
                auth,
            ),
            counters,
        )
    }

    #[tokio::test]
    async fn test_pull_streams_progress_and_completes() {
        let (session, counters) = session(None);
        let tracker = ProgressTracker::new(Arc::new(NotificationDispatcher::inline()));

        session
            .pull("flink:1.18", tracker.phase(Phase::Pull))
            .await
            .unwrap();

        let snapshot = tracker.snapshot(Phase::Pull);
        assert!(snapshot.complete);
        assert_eq!(snapshot.bytes_current(), 10);
        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
        // 第三者レジストリには認証情報を送らない
        assert_eq!(*counters.credentials.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_failure_is_wrapped_and_session_released() {
        let (session, counters) = session(Some("unauthorized"));
        let tracker = ProgressTracker::new(Arc::new(NotificationDispatcher::inline()));

        let err = session
            .push("reg.example.com/data/job:v1", tracker.phase(Phase::Push))
            .await
            .unwrap_err();

        assert_eq!(err.step(), Step::PushImage);
        assert_eq!(err.message(), "push failed for image reg.example.com/data/job:v1");
        assert_eq!(err.root_cause(), "unauthorized");
        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
        assert!(!tracker.snapshot(Phase::Push).complete);
        assert_eq!(
            *counters.credentials.lock().unwrap(),
            vec![Some("bot".to_string())]
        );
    }

    #[tokio::test]
    async fn test_invalid_tag_fails_before_connecting() {
        let (session, counters) = session(None);
        let tracker = ProgressTracker::new(Arc::new(NotificationDispatcher::inline()));

        let err = session
            .push("reg.example.com/data/job:-bad", tracker.phase(Phase::Push))
            .await
            .unwrap_err();

        assert_eq!(err.step(), Step::PushImage);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_build_returns_image_id() {
        let (session, counters) = session(None);
        let tracker = ProgressTracker::new(Arc::new(NotificationDispatcher::inline()));
        let dir = tempfile::tempdir().unwrap();

        let id = session
            .build(
                dir.path(),
                &dir.path().join("Dockerfile"),
                &["reg.example.com/data/job".to_string()],
                tracker.phase(Phase::Build),
            )
            .await
            .unwrap();

        assert_eq!(id, "sha256:feed");
        assert!(tracker.snapshot(Phase::Build).complete);
        assert_eq!(counters.open.load(Ordering::SeqCst), 0);
    }
}
