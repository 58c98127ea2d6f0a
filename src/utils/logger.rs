use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILE: &str = "app.log";

fn console_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("fog_client=debug,request_script=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fog_client=info,request_script=info"))
    }
}

/// 控制台 + 檔案日誌 (<data_dir>/app.log)
pub fn init_cli_logger(verbose: bool, data_dir: &Path) {
    // 檔案層固定記錄 debug
    let file_layer = fs::create_dir_all(data_dir)
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(data_dir.join(LOG_FILE))
        })
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new("fog_client=debug"))
        });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_filter(console_filter(verbose)),
        )
        .with(file_layer)
        .init();
}

pub fn init_json_logger(verbose: bool) {
    tracing_subscriber::registry()
        .with(console_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .json(), // 容器內無人值守執行時方便收集
        )
        .init();
}
