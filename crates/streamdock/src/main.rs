mod config;
mod progress;

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use progress::TerminalProgress;
use std::path::PathBuf;
use std::sync::Arc;
use streamdock_build::{BuildPipeline, DockerConnector, NotificationDispatcher, compile_tag};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sdock")]
#[command(about = "Package streaming jobs into container images", long_about = None)]
struct Cli {
    /// ログを詳細に出力
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// ジョブをイメージにビルドしてレジストリに push
    Build {
        /// リクエストファイル（YAML）
        #[arg(short, long, env = "STREAMDOCK_REQUEST")]
        request: Option<PathBuf>,
        /// ワークスペースのルートディレクトリ
        #[arg(short, long, env = "STREAMDOCK_WORKSPACE")]
        workspace: Option<PathBuf>,
        /// 進捗通知のワーカー数
        #[arg(long)]
        workers: Option<usize>,
    },
    /// 完全なイメージ参照を表示
    Tag {
        /// 元のタグ（例: my-job:v1）
        raw: String,
        /// イメージのネームスペース
        #[arg(short, long, default_value = "")]
        namespace: String,
        /// レジストリのアドレス
        #[arg(short, long, default_value = "")]
        registry: String,
    },
    /// リクエストファイルを検証して解決後の内容を表示
    Validate {
        /// リクエストファイル（YAML）
        #[arg(short, long, env = "STREAMDOCK_REQUEST")]
        request: Option<PathBuf>,
    },
    /// バージョン情報を表示
    Version,
}

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Version => {
            println!("streamdock {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Tag {
            raw,
            namespace,
            registry,
        } => {
            println!("{}", compile_tag(&raw, &namespace, &registry));
        }
        Commands::Validate { request } => {
            let path = config::find_request_file(request.as_deref())?;
            let request = config::load_request(&path)?;

            println!("{} {}", "✓".green(), path.display());
            println!(
                "  image: {}",
                compile_tag(
                    &request.raw_image_tag(),
                    &request.registry.namespace,
                    &request.registry.address
                )
                .cyan()
            );
            println!("  workspace: {}", request.workspace_name());
            println!();
            print!("{}", serde_yaml::to_string(&request)?);
        }
        Commands::Build {
            request,
            workspace,
            workers,
        } => {
            let path = config::find_request_file(request.as_deref())?;
            let request = config::load_request(&path)?;
            let config = config::pipeline_config(workspace, workers);

            println!(
                "{} {} ({})",
                "Building".green().bold(),
                request.app_name.cyan(),
                request.workspace_name()
            );

            let dispatcher = Arc::new(NotificationDispatcher::new(&config.dispatcher)?);
            let progress = TerminalProgress::new();
            let pipeline = BuildPipeline::new(&config.workspace_root, DockerConnector, dispatcher.clone());
            pipeline.register_progress_observer(progress.clone());

            let result = pipeline.run(&request).await;
            dispatcher.shutdown();

            match result {
                Ok(response) => {
                    progress.clear();
                    println!("{} {}", "✓ Pushed".green().bold(), response.image_tag.cyan());
                    println!("  image id: {}", response.image_id);
                    println!("  artifact: {}", response.artifact_image_path);
                    println!("  workspace: {}", response.workspace_path.display());
                    for (name, path) in &response.template_paths {
                        println!("  template {}: {}", name, path.display());
                    }
                }
                Err(e) => {
                    progress.abandon(e.step.name());
                    eprintln!();
                    eprintln!("{} {}", "✗".red().bold(), e.user_message());
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
