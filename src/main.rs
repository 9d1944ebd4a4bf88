use std::env;

use anyhow::Context;
use tracing::{error, info, warn};
use transfer_state_store::{
    config::AppConfig,
    logging,
    persistence::{
        MigrationOutcome, ModifiedTask, PausedTask, Record, ResumeData, TaskRecord, TaskStateStore,
    },
};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = AppConfig::load_or_default(&config_path).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!(
        "Transfer State Store v{} 启动中... (配置: {})",
        env!("CARGO_PKG_VERSION"),
        config_path
    );

    let base_dir = env::current_dir().context("无法获取当前工作目录")?;
    let store = TaskStateStore::from_config(&config.persistence, &base_dir)
        .await
        .context("打开任务状态存储失败")?;

    match store.initialize().await {
        MigrationOutcome::UpToDate => info!("schema 无需迁移"),
        MigrationOutcome::Migrated(report) => info!(
            "schema 已迁移: {} -> {}，迁移 {} 条，保留 {} 条，跳过 {} 条，清理旧集合: {}",
            report.from,
            report.to,
            report.migrated,
            report.kept_existing,
            report.skipped.len(),
            report.purged_legacy
        ),
        MigrationOutcome::Failed { from, error: e } => error!(
            "schema 迁移失败，以降级模式运行 (来源: {:?}): {}",
            from, e
        ),
    }

    match store.stored_schema_identity().await {
        Ok(stored) => info!(
            "schema: 介质={}，代码={}",
            stored,
            store.current_schema_identity()
        ),
        Err(e) => warn!("读取 schema 版本戳失败: {}", e),
    }

    log_count::<TaskRecord>(&store).await;
    log_count::<PausedTask>(&store).await;
    log_count::<ModifiedTask>(&store).await;
    log_count::<ResumeData>(&store).await;

    let retention_days = config.persistence.task_record_retention_days;
    if retention_days > 0 {
        let purged = store
            .purge_finished_task_records(retention_days)
            .await
            .context("清理过期任务记录失败")?;
        info!("过期任务记录清理完成: {} 条", purged);
    }

    info!("任务状态存储就绪 (介质: {})", store.medium_kind());

    Ok(())
}

async fn log_count<R: Record>(store: &TaskStateStore) {
    match store.retrieve_all::<R>().await {
        Ok(records) => info!("{}: {} 条", R::CATEGORY, records.len()),
        Err(e) => warn!("读取 {} 失败: {}", R::CATEGORY, e),
    }
}
