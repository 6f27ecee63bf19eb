//! ビルドパイプラインの結合テスト
//!
//! コンテナエンジンはモックに差し替え、進捗イベントは別スレッドから流す。

use bollard::auth::DockerCredentials;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use streamdock_build::{
    ArtifactPackager, BuildPipeline, BuildRequest, ContainerClient, ContainerConnector,
    DependencySpec, DevelopmentMode, EventSink, JobSource, NotificationDispatcher,
    PackagedArtifact, Phase, ProgressEvent, ProgressSnapshot, RegistryConfig, Step,
    TemplateExporter, TemplateSpec, compile_tag,
};
use tokio::sync::oneshot;

#[derive(Default)]
struct EngineState {
    open: AtomicUsize,
    pulls: AtomicUsize,
    builds: AtomicUsize,
    pushes: AtomicUsize,
    pushed: Mutex<Vec<String>>,
    /// 呼び出された操作の順序
    calls: Mutex<Vec<&'static str>>,
}

impl EngineState {
    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct MockConnector {
    state: Arc<EngineState>,
    /// 失敗させる操作（"build" / "push"）
    fail: Option<&'static str>,
}

struct MockClient {
    state: Arc<EngineState>,
    fail: Option<&'static str>,
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContainerConnector for MockConnector {
    type Client = MockClient;

    async fn connect(&self) -> anyhow::Result<MockClient> {
        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(MockClient {
            state: self.state.clone(),
            fail: self.fail,
        })
    }
}

/// エンジンのコールバックスレッドを模して別スレッドからイベントを流す
async fn stream_events(
    events: EventSink,
    batch: Vec<ProgressEvent>,
    outcome: anyhow::Result<()>,
) -> anyhow::Result<()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        for event in batch {
            events(event);
        }
        let _ = tx.send(outcome);
    });
    rx.await?
}

fn layer(id: &str, current: u64, total: u64) -> ProgressEvent {
    ProgressEvent::Layer {
        id: id.to_string(),
        status: "Downloading".to_string(),
        current,
        total,
    }
}

impl ContainerClient for MockClient {
    async fn pull(
        &self,
        _image: &str,
        _credentials: Option<DockerCredentials>,
        events: EventSink,
    ) -> anyhow::Result<()> {
        self.state.pulls.fetch_add(1, Ordering::SeqCst);
        self.state.record("pull");
        stream_events(events, vec![layer("a", 10, 100), layer("a", 100, 100)], Ok(())).await
    }

    async fn build(
        &self,
        context_dir: &Path,
        manifest_path: &Path,
        _tags: &[String],
        events: EventSink,
    ) -> anyhow::Result<String> {
        self.state.builds.fetch_add(1, Ordering::SeqCst);
        self.state.record("build");
        anyhow::ensure!(manifest_path.starts_with(context_dir), "manifest outside context");
        let batch = vec![
            ProgressEvent::Instruction {
                index: Some((1, 2)),
                text: "FROM flink:1.18".to_string(),
            },
            ProgressEvent::Instruction {
                index: Some((2, 2)),
                text: "COPY job.jar /opt/flink/usrlib/job.jar".to_string(),
            },
        ];
        let outcome = match self.fail {
            Some("build") => Err(anyhow::anyhow!("COPY failed: file not found")),
            _ => Ok(()),
        };
        stream_events(events, batch, outcome).await?;
        Ok("sha256:0123456789ab".to_string())
    }

    async fn push(
        &self,
        image: &str,
        _credentials: Option<DockerCredentials>,
        events: EventSink,
    ) -> anyhow::Result<()> {
        self.state.pushes.fetch_add(1, Ordering::SeqCst);
        self.state.record("push");
        let outcome = if self.fail == Some("push") {
            Err(anyhow::anyhow!("denied: requested access to the resource is denied"))
        } else {
            self.state.pushed.lock().unwrap().push(image.to_string());
            Ok(())
        };
        stream_events(events, vec![layer("a", 50, 100)], outcome).await
    }
}

/// 呼び出し回数を数えるパッケージャ
#[derive(Clone, Default)]
struct CountingPackager {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl ArtifactPackager for CountingPackager {
    fn package_artifact(
        &self,
        _request: &BuildRequest,
        output_dir: &Path,
    ) -> anyhow::Result<PackagedArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("compilation failed");
        }
        let path = output_dir.join("job.jar");
        std::fs::write(&path, "jar")?;
        Ok(PackagedArtifact {
            path,
            extra_libs: vec![],
            job_definition: None,
        })
    }
}

#[derive(Clone, Default)]
struct CountingExporter {
    calls: Arc<AtomicUsize>,
}

impl TemplateExporter for CountingExporter {
    fn export_templates(
        &self,
        workspace: &Path,
        templates: &TemplateSpec,
    ) -> anyhow::Result<std::collections::BTreeMap<String, PathBuf>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(templates
            .templates
            .keys()
            .map(|name| (name.clone(), workspace.join(format!("{}.yaml", name))))
            .collect())
    }
}

fn request(jar: PathBuf, templates: Option<TemplateSpec>) -> BuildRequest {
    BuildRequest {
        cluster_id: "orders".into(),
        namespace: "streaming".into(),
        app_name: "order-enricher".into(),
        main_class: "com.example.OrderEnricher".into(),
        mode: DevelopmentMode::CustomCode,
        job: JobSource {
            jar,
            definition: None,
        },
        dependency: DependencySpec::default(),
        base_image: "flink:1.18".into(),
        image_tag: Some("order-enricher:v1".into()),
        templates,
        registry: RegistryConfig {
            address: "registry.example.com".into(),
            namespace: "data".into(),
            username: Some("bot".into()),
            password: Some("secret".into()),
        },
        integrate_platform: false,
        integration_libs: vec![],
    }
}

fn pod_template() -> TemplateSpec {
    serde_yaml::from_str("pod-template:\n  apiVersion: v1\n  kind: Pod\n").unwrap()
}

struct Fixture {
    _root: tempfile::TempDir,
    workspace_root: PathBuf,
    jar: PathBuf,
    state: Arc<EngineState>,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let jar = root.path().join("target.jar");
        std::fs::write(&jar, "jar").unwrap();
        Self {
            workspace_root: root.path().join("workspace"),
            jar,
            _root: root,
            state: Arc::new(EngineState::default()),
        }
    }

    fn connector(&self, fail: Option<&'static str>) -> MockConnector {
        MockConnector {
            state: self.state.clone(),
            fail,
        }
    }
}

#[tokio::test]
async fn test_successful_build_returns_response() {
    let fx = Fixture::new();
    let dispatcher = Arc::new(NotificationDispatcher::inline());
    let req = request(fx.jar.clone(), Some(pod_template()));

    let response = BuildPipeline::new(&fx.workspace_root, fx.connector(None), dispatcher)
        .run(&req)
        .await
        .unwrap();

    let expected = compile_tag("order-enricher:v1", "data", "registry.example.com");
    assert_eq!(expected, "registry.example.com/data/order-enricher:v1");
    assert_eq!(response.image_tag, expected);
    assert_eq!(response.image_id, "sha256:0123456789ab");
    assert_eq!(response.workspace_path, fx.workspace_root.join("orders@streaming"));
    assert_eq!(
        response.template_paths["pod-template"],
        response.workspace_path.join("pod-template.yaml")
    );
    assert!(response.template_paths["pod-template"].is_file());
    assert_eq!(
        response.artifact_image_path,
        "local:///opt/flink/usrlib/order-enricher.jar"
    );
    assert!(response.workspace_path.join("Dockerfile").is_file());
    assert_eq!(*fx.state.pushed.lock().unwrap(), vec![expected]);
    assert_eq!(fx.state.calls(), vec!["pull", "build", "push"]);
    assert_eq!(fx.state.open.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_packaging_failure_stops_remaining_steps() {
    let fx = Fixture::new();
    let dispatcher = Arc::new(NotificationDispatcher::inline());
    let packager = CountingPackager {
        fail: true,
        ..Default::default()
    };
    let req = request(fx.jar.clone(), None);

    let err = BuildPipeline::new(&fx.workspace_root, fx.connector(None), dispatcher)
        .with_packager(packager.clone())
        .run(&req)
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::PackageArtifact);
    assert_eq!(err.step.index(), 3);
    assert_eq!(err.source.root_cause(), "compilation failed");
    assert_eq!(packager.calls.load(Ordering::SeqCst), 1);
    assert!(!fx.workspace_root.join("orders@streaming/Dockerfile").exists());
    assert_eq!(fx.state.pulls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.state.builds.load(Ordering::SeqCst), 0);
    assert_eq!(fx.state.pushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_build_failure_never_pushes() {
    let fx = Fixture::new();
    let dispatcher = Arc::new(NotificationDispatcher::inline());

    let err = BuildPipeline::new(&fx.workspace_root, fx.connector(Some("build")), dispatcher)
        .with_packager(CountingPackager::default())
        .run(&request(fx.jar.clone(), None))
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::BuildImage);
    assert_eq!(err.step.index(), 6);
    assert_eq!(err.source.root_cause(), "COPY failed: file not found");
    assert_eq!(fx.state.calls(), vec!["pull", "build"]);
    assert_eq!(fx.state.pushes.load(Ordering::SeqCst), 0);
    assert!(fx.state.pushed.lock().unwrap().is_empty());
    assert_eq!(fx.state.open.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_path_like_cluster_id_is_rejected_before_touching_disk() {
    let fx = Fixture::new();
    let outside = fx._root.path().join("victim@streaming");
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("precious.txt"), "keep").unwrap();

    let dispatcher = Arc::new(NotificationDispatcher::inline());
    let mut req = request(fx.jar.clone(), None);
    req.cluster_id = "../victim".into();

    let err = BuildPipeline::new(&fx.workspace_root, fx.connector(None), dispatcher)
        .run(&req)
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::InitWorkspace);
    assert!(outside.join("precious.txt").exists());
    assert!(fx.state.calls().is_empty());
}

#[tokio::test]
async fn test_empty_templates_skip_export() {
    let fx = Fixture::new();
    let exporter = CountingExporter::default();
    let empty: TemplateSpec = serde_yaml::from_str("pod-template: ~").unwrap();

    for templates in [None, Some(TemplateSpec::default()), Some(empty)] {
        let dispatcher = Arc::new(NotificationDispatcher::inline());
        let response = BuildPipeline::new(&fx.workspace_root, fx.connector(None), dispatcher)
            .with_exporter(exporter.clone())
            .with_packager(CountingPackager::default())
            .run(&request(fx.jar.clone(), templates))
            .await
            .unwrap();
        assert!(response.template_paths.is_empty());
    }

    assert_eq!(exporter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_observer_receives_terminal_snapshot_per_phase() {
    let fx = Fixture::new();
    let dispatcher = Arc::new(NotificationDispatcher::inline());
    let seen: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::default();
    let sink = seen.clone();

    let pipeline = BuildPipeline::new(&fx.workspace_root, fx.connector(None), dispatcher)
        .with_packager(CountingPackager::default());
    pipeline.register_progress_observer(
        move |_: Phase, snapshot: &ProgressSnapshot| -> anyhow::Result<()> {
            sink.lock().unwrap().push(snapshot.clone());
            Ok(())
        },
    );
    pipeline.run(&request(fx.jar.clone(), None)).await.unwrap();

    let seen = seen.lock().unwrap();
    for phase in Phase::ALL {
        let snapshots: Vec<_> = seen.iter().filter(|s| s.phase == phase).collect();
        assert!(!snapshots.is_empty(), "no progress for {}", phase);
        // フェーズ内では順序通りに届き、最後が完了スナップショット
        assert!(snapshots.windows(2).all(|w| w[0].sequence < w[1].sequence));
        let last = snapshots.last().unwrap();
        assert!(last.complete);
        assert_eq!(snapshots.iter().filter(|s| s.complete).count(), 1);
    }

    let pull = seen.iter().rfind(|s| s.phase == Phase::Pull).unwrap();
    assert_eq!(pull.bytes_current(), 100);
    let build = seen.iter().rfind(|s| s.phase == Phase::Build).unwrap();
    assert_eq!(build.instruction_index, Some((2, 2)));
}

#[tokio::test]
async fn test_push_failure_is_reported_and_session_released() {
    let fx = Fixture::new();
    let dispatcher = Arc::new(NotificationDispatcher::inline());
    let completed: Arc<Mutex<Vec<Phase>>> = Arc::default();
    let sink = completed.clone();

    let pipeline = BuildPipeline::new(&fx.workspace_root, fx.connector(Some("push")), dispatcher)
        .with_packager(CountingPackager::default());
    pipeline.register_progress_observer(
        move |phase: Phase, snapshot: &ProgressSnapshot| -> anyhow::Result<()> {
            if snapshot.complete {
                sink.lock().unwrap().push(phase);
            }
            Ok(())
        },
    );
    let err = pipeline
        .run(&request(fx.jar.clone(), None))
        .await
        .unwrap_err();

    assert_eq!(err.step, Step::PushImage);
    assert!(err.message.contains("push failed for image"));
    assert!(err.user_message().contains("denied"));
    assert_eq!(fx.state.pushes.load(Ordering::SeqCst), 1);
    assert_eq!(fx.state.calls(), vec!["pull", "build", "push"]);
    assert_eq!(fx.state.open.load(Ordering::SeqCst), 0);
    // 失敗したフェーズは完了扱いにしない
    assert_eq!(*completed.lock().unwrap(), vec![Phase::Pull, Phase::Build]);
}

#[tokio::test]
async fn test_worker_pool_dispatcher_delivers_final_snapshots() {
    let fx = Fixture::new();
    let dispatcher = Arc::new(
        NotificationDispatcher::new(&streamdock_build::DispatcherConfig {
            workers: Some(2),
            queue_capacity: 4,
        })
        .unwrap(),
    );
    let completed: Arc<Mutex<Vec<Phase>>> = Arc::default();
    let sink = completed.clone();

    let pipeline = BuildPipeline::new(&fx.workspace_root, fx.connector(None), dispatcher.clone())
        .with_packager(CountingPackager::default());
    pipeline.register_progress_observer(
        move |phase: Phase, snapshot: &ProgressSnapshot| -> anyhow::Result<()> {
            if snapshot.complete {
                sink.lock().unwrap().push(phase);
            }
            Ok(())
        },
    );
    pipeline.run(&request(fx.jar.clone(), None)).await.unwrap();
    dispatcher.shutdown();

    let mut completed = completed.lock().unwrap().clone();
    completed.sort();
    assert_eq!(completed, vec![Phase::Pull, Phase::Build, Phase::Push]);
}
