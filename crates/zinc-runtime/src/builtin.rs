//! Built-in `status` plugin.
//!
//! Enabled with the `builtin-plugins` feature and linked under the module
//! name `status`, so `plugins = ["status"]` in the configuration mounts it.
//!
//! - `status` (hidden): uptime, mounted plugins, commands, contexts and
//!   adapters
//! - `logs [lines:integer]`: the tail of the current log file, 10 lines by
//!   default. `-c` empties the file, after a copy when `-b` is also given.
//!   `-b` alone only copies it. `-d` reports its path, size and line count.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use zinc_core::resolver::{PLUGIN_MODULES, PluginModule};
use zinc_core::{
    ActionResult, BoxError, CommandDecl, Context, Invocation, NamedService, PluginOptions,
};

use crate::runtime::RuntimeInfo;

const DEFAULT_LOG_LINES: usize = 10;
const MAX_LOG_LINES: usize = 200;

#[linkme::distributed_slice(PLUGIN_MODULES)]
static STATUS_PLUGIN: PluginModule = PluginModule {
    name: "status",
    build: status_plugin,
};

/// Builds the `status` plugin. Requires the `runtime` service.
pub fn status_plugin() -> PluginOptions {
    PluginOptions::new("status", |ctx| {
        ctx.command(
            CommandDecl::new("status")
                .description("Show runtime status")
                .hidden(true)
                .action(|inv| async move { Ok(Some(status_report(&inv))) }),
        )?;
        ctx.command(
            CommandDecl::new("logs [lines:integer]")
                .description("Show or manage the current log file")
                .option("-c [clean:boolean] empty the log file")
                .option("-b [backup:boolean] copy the log file aside")
                .option("-d [detail:boolean] show the log file size")
                .action(|inv| async move { logs(&inv).await }),
        )?;
        Ok(())
    })
    .description("Runtime status commands")
    .depends_on([RuntimeInfo::KEY])
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, hours, minutes, seconds) =
        (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

fn status_report(inv: &Invocation) -> String {
    let root: Context = inv.context.root();
    let mut report = String::from("Zinc status");
    if let Some(info) = inv.context.service::<RuntimeInfo>() {
        let _ = write!(
            report,
            "\nversion: {}\nuptime: {}",
            info.version(),
            format_uptime(info.uptime())
        );
    }

    let plugins = root.plugin_list();
    let enabled = plugins.iter().filter(|p| p.is_enabled()).count();
    let _ = write!(
        report,
        "\nplugins: {} ({} enabled)\ncommands: {}\ncontexts: {}",
        plugins.len(),
        enabled,
        root.command_list().len(),
        root.context_count()
    );

    let adapters = root.adapters();
    if adapters.is_empty() {
        report.push_str("\nadapters: none");
    } else {
        let _ = write!(report, "\nadapters: {}", adapters.join(", "));
    }
    report
}

async fn logs(inv: &Invocation) -> ActionResult {
    let Some(path) = inv
        .context
        .service::<RuntimeInfo>()
        .and_then(|info| info.log_file())
    else {
        return Ok(Some("File logging is disabled".to_string()));
    };

    if inv.flag("clean") {
        let backup = match inv.flag("backup") {
            true => Some(backup_log(&path).await?),
            false => None,
        };
        clean_log(&path).await?;
        return Ok(Some(match backup {
            Some(copy) => format!("Log cleaned, backup at {}", copy.display()),
            None => "Log cleaned".to_string(),
        }));
    }
    if inv.flag("backup") {
        let copy = backup_log(&path).await?;
        return Ok(Some(format!("Log backed up to {}", copy.display())));
    }
    if inv.flag("detail") {
        return Ok(Some(log_detail(&path).await?));
    }

    let lines = inv
        .arg(0)
        .and_then(|v| v.as_u64())
        .map_or(DEFAULT_LOG_LINES, |n| n as usize)
        .clamp(1, MAX_LOG_LINES);
    tail_log(&path, lines).await.map(Some)
}

async fn tail_log(path: &Path, lines: usize) -> Result<String, BoxError> {
    let content = tokio::fs::read_to_string(path).await?;
    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    if tail.is_empty() {
        return Ok(format!("{} is empty", path.display()));
    }
    Ok(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
}

/// Copies the log next to itself as `<name>.<unix secs>.bak`.
async fn backup_log(path: &Path) -> Result<PathBuf, BoxError> {
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let mut name = path.file_name().unwrap_or(path.as_os_str()).to_owned();
    name.push(format!(".{stamp}.bak"));
    let copy = path.with_file_name(name);
    tokio::fs::copy(path, &copy).await?;
    info!(from = %path.display(), to = %copy.display(), "Log file backed up");
    Ok(copy)
}

// The appender writes in append mode, so truncating in place is safe.
async fn clean_log(path: &Path) -> Result<(), BoxError> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    info!(path = %path.display(), "Log file cleaned");
    Ok(())
}

async fn log_detail(path: &Path) -> Result<String, BoxError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(format!(
        "path: {}\nsize: {} bytes\nlines: {}",
        path.display(),
        content.len(),
        content.lines().count()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use zinc_core::{ModuleMap, SessionRecord};

    use crate::config::{LogOutput, ZincConfig};
    use crate::runtime::ZincRuntime;

    fn runtime(name: &str, config: ZincConfig) -> ZincRuntime {
        let data_dir: PathBuf =
            std::env::temp_dir().join(format!("zinc-builtin-{name}-{}", std::process::id()));
        ZincRuntime::builder()
            .config(ZincConfig {
                plugins: vec!["status".into()],
                data_dir,
                ..config
            })
            .resolver(Arc::new(ModuleMap::new().plugin(status_plugin())))
            .build()
            .unwrap()
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "0m 59s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1h 2m 5s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m");
    }

    #[tokio::test]
    async fn test_status_command() {
        let runtime = runtime("status", ZincConfig::default());
        runtime.start().await.unwrap();

        let session = SessionRecord::new("console", "message").into_ref();
        let reply = runtime.root().execute(session, "status").await.unwrap().unwrap();
        assert!(reply.starts_with("Zinc status"));
        assert!(reply.contains("plugins: 1 (1 enabled)"));
        assert!(reply.contains("commands: 2"));
        assert!(reply.contains("adapters: none"));
        let status = runtime.root().find_command("status").unwrap();
        assert!(status.is_hidden());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_without_file_output() {
        let runtime = runtime("logs", ZincConfig::default());
        runtime.start().await.unwrap();
        assert_eq!(runtime.config().logging.output, LogOutput::Stdout);

        let session = SessionRecord::new("console", "message").into_ref();
        for input in ["logs 5", "logs -c -b", "logs --detail"] {
            let reply = runtime.root().execute(session.clone(), input).await.unwrap();
            assert_eq!(reply.as_deref(), Some("File logging is disabled"));
        }

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_file_operations() {
        let dir = std::env::temp_dir().join(format!("zinc-builtin-logfile-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("zinc.log");
        let content: String = (1..=15).map(|n| format!("line {n}\n")).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let tail = tail_log(&path, DEFAULT_LOG_LINES).await.unwrap();
        assert_eq!(tail.lines().count(), 10);
        assert!(tail.starts_with("line 6") && tail.ends_with("line 15"));

        let detail = log_detail(&path).await.unwrap();
        assert!(detail.contains(&format!("size: {} bytes", content.len())));
        assert!(detail.ends_with("lines: 15"));

        let copy = backup_log(&path).await.unwrap();
        assert_eq!(copy.parent(), path.parent());
        assert!(copy.file_name().unwrap().to_string_lossy().ends_with(".bak"));
        assert_eq!(tokio::fs::read_to_string(&copy).await.unwrap(), content);

        clean_log(&path).await.unwrap();
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 0);
        assert_eq!(tail_log(&path, 5).await.unwrap(), format!("{} is empty", path.display()));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
