use anyhow::{Context, Result};
use graph_drive_uploader::{
    config::AppConfig, logging, GraphClient, OAuthRefreshProvider, TokenManager, UploadManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 配置文件路径
const CONFIG_PATH: &str = "config/app.toml";

const USAGE: &str = "\
用法:
  graph-drive-uploader <本地路径> [云盘文件夹]      上传文件或文件夹并输出分享链接
  graph-drive-uploader upload <本地路径> [云盘文件夹]
  graph-drive-uploader search <关键字>
  graph-drive-uploader ls [云盘文件夹]
  graph-drive-uploader rm <条目ID>
  graph-drive-uploader whoami";

/// 命令行子命令
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Upload { local: PathBuf, remote: String },
    Search(String),
    List(String),
    Delete(String),
    WhoAmI,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        let arg = |i: usize| args.get(i).cloned();
        match args.first().map(String::as_str)? {
            "upload" => Some(Command::Upload {
                local: PathBuf::from(arg(1)?),
                remote: arg(2).unwrap_or_default(),
            }),
            "search" => Some(Command::Search(arg(1)?)),
            "ls" => Some(Command::List(arg(1).unwrap_or_default())),
            "rm" => Some(Command::Delete(arg(1)?)),
            "whoami" => Some(Command::WhoAmI),
            "-h" | "--help" | "help" => None,
            local => Some(Command::Upload {
                local: PathBuf::from(local),
                remote: arg(1).unwrap_or_default(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    // 加载配置（不存在时写入默认配置）
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 初始化日志系统，guard 必须活到 main 结束
    let _log_guard = logging::init_logging(&config.log);
    config.validate().context("配置校验失败")?;

    info!("Graph Drive Uploader v{}", env!("CARGO_PKG_VERSION"));

    let provider = OAuthRefreshProvider::new(config.graph.clone())
        .context("创建令牌提供者失败")?;
    let tokens = Arc::new(TokenManager::new(Arc::new(provider)));
    let identity = tokens.ensure_valid().await.context("令牌校验失败")?;
    let account = identity
        .user_principal_name
        .or(identity.display_name)
        .unwrap_or(identity.id);
    info!("当前账号: {}", account);

    let client = Arc::new(GraphClient::new(&config.graph, tokens.clone())?);
    let manager = UploadManager::new(client.clone(), client, tokens, config.upload.clone());

    match command {
        Command::Upload { local, remote } => {
            // Ctrl+C 协作式取消：当前分片发完后停止并删除会话
            let canceller = manager.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("收到中断信号，正在取消上传...");
                    canceller.cancel();
                }
            });

            match manager.upload(&local, &remote).await {
                Ok(url) => {
                    let progress = manager.progress();
                    info!(
                        "上传完成: {} bytes, 平均速度 {} bytes/s",
                        progress.uploaded_bytes(),
                        progress.speed()
                    );
                    println!("{}", url);
                }
                Err(e) => {
                    error!("上传失败: {}", e);
                    for task in manager.tasks().iter().filter(|t| t.error.is_some()) {
                        error!(
                            "  {} - {}",
                            task.local_path.display(),
                            task.error.as_deref().unwrap_or_default()
                        );
                    }
                    return Err(e.into());
                }
            }
        }
        Command::Search(query) => {
            for item in manager.drive().search(&query).await? {
                println!("{}\t{}\t{}", item.id, item.name, item.url.unwrap_or_default());
            }
        }
        Command::List(folder) => {
            for item in manager.drive().list_children(&folder).await? {
                println!(
                    "{}\t{}\t{}",
                    item.id,
                    item.name,
                    item.size.map(|s| s.to_string()).unwrap_or_default()
                );
            }
        }
        Command::Delete(item_id) => {
            manager.drive().delete_item(&item_id).await?;
            println!("已删除 {}", item_id);
        }
        Command::WhoAmI => println!("{}", account),
    }

    Ok(())
}
