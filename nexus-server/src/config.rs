use std::env;
use std::sync::Arc;

use camino::Utf8PathBuf;

/// Process-wide configuration resolved once at startup from CLI flags and
/// environment variable fallbacks. Cheap to clone: every spawned task gets
/// its own handle onto the same underlying value.
#[derive(Debug, Clone)]
pub struct Conf {
    pub port_filename: Utf8PathBuf,
    pub pid: Option<u32>,
    pub debug: bool,
    pub no_observability: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub run_id: Option<String>,
}

impl Conf {
    pub fn from_args(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut port_filename = Utf8PathBuf::from("port_file.txt");
        let mut pid = None;
        let mut debug = env::var_os("WANDB_NEXUS_DEBUG").is_some();
        let mut no_observability = false;

        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--port-filename" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("missing value for --port-filename"))?;
                    port_filename = Utf8PathBuf::from(value);
                }
                "--pid" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("missing value for --pid"))?;
                    pid = Some(value.parse().map_err(|_| anyhow::anyhow!("invalid --pid value: {value}"))?);
                }
                "--debug" => {
                    let value = args.next().ok_or_else(|| anyhow::anyhow!("missing value for --debug"))?;
                    debug = debug || parse_bool(&value)?;
                }
                "--no-observability" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("missing value for --no-observability"))?;
                    no_observability = parse_bool(&value)?;
                }
                other => anyhow::bail!("unrecognized argument: {other}"),
            }
        }

        Ok(Self {
            port_filename,
            pid,
            debug,
            no_observability,
            base_url: env::var("WANDB_BASE_URL").ok(),
            api_key: env::var("WANDB_API_KEY").ok(),
            run_id: env::var("WANDB_RUN_ID").ok(),
        })
    }

    /// Directory the rolling log files and the boot artifacts live next to.
    pub fn log_dir(&self) -> Utf8PathBuf {
        self.port_filename
            .parent()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => anyhow::bail!("invalid boolean value: {other}"),
    }
}

/// Cheaply-cloneable handle to the resolved process configuration.
///
/// Mirrors the handle-around-an-`Arc` idiom used elsewhere in this codebase
/// for config that is resolved once and then read by many tasks.
#[derive(Debug, Clone)]
pub struct ConfHandle(Arc<Conf>);

impl ConfHandle {
    pub fn new(conf: Conf) -> Self {
        Self(Arc::new(conf))
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = ["--port-filename", "foo.txt", "--pid", "42", "--debug", "true"]
            .into_iter()
            .map(str::to_owned);
        let conf = Conf::from_args(args).expect("valid args");
        assert_eq!(conf.port_filename, Utf8PathBuf::from("foo.txt"));
        assert_eq!(conf.pid, Some(42));
        assert!(conf.debug);
        assert!(!conf.no_observability);
    }

    #[test]
    fn defaults_when_no_args() {
        let conf = Conf::from_args(std::iter::empty()).expect("valid args");
        assert_eq!(conf.port_filename, Utf8PathBuf::from("port_file.txt"));
        assert_eq!(conf.pid, None);
    }

    #[test]
    fn rejects_unknown_flag() {
        let args = ["--bogus"].into_iter().map(str::to_owned);
        assert!(Conf::from_args(args).is_err());
    }
}
