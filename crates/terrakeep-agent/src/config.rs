use std::time::Duration;

const DEFAULT_SERVER_BIN: &str = "TerrariaServer";
const DEFAULT_MAX_COMMANDS: usize = 500;
const DEFAULT_COMMAND_DELAY_MS: u64 = 500;
const DEFAULT_STOP_TIMEOUT_SEC: u64 = 30;
const DEFAULT_READY_TIMEOUT_SEC: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5000;
const DEFAULT_STALE_AFTER_SEC: u64 = 30;
const DEFAULT_DOS_THRESHOLD: u32 = 25;
const DEFAULT_CONSOLE_MAX_LINES: usize = 1000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// How loudly raw server output is echoed into the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" | "0" => Some(Self::Quiet),
            "normal" | "1" => Some(Self::Normal),
            "verbose" | "2" | "debug" => Some(Self::Verbose),
            _ => None,
        }
    }
}

/// Timing and capacity knobs for the connection correlator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub dos_threshold: u32,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SEC),
            dos_threshold: DEFAULT_DOS_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub max_commands: usize,
    pub command_delay: Duration,
    pub stop_timeout: Duration,
    pub ready_timeout: Duration,
    pub console_max_lines: usize,
    pub verbosity: Verbosity,
    pub correlator: CorrelatorConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_SERVER_BIN.to_string(),
            args: Vec::new(),
            max_commands: DEFAULT_MAX_COMMANDS,
            command_delay: Duration::from_millis(DEFAULT_COMMAND_DELAY_MS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SEC),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SEC),
            console_max_lines: DEFAULT_CONSOLE_MAX_LINES,
            verbosity: Verbosity::default(),
            correlator: CorrelatorConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Reads `TERRAKEEP_*` overrides. Unparseable values fall back to defaults;
    /// out-of-range values are clamped.
    pub fn from_env() -> Self {
        let d = Self::default();
        let dc = d.correlator;

        let program = std::env::var("TERRAKEEP_SERVER_BIN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(d.program);

        let verbosity = std::env::var("TERRAKEEP_VERBOSITY")
            .ok()
            .and_then(|v| Verbosity::parse(&v))
            .unwrap_or(d.verbosity);

        Self {
            program,
            args: d.args,
            max_commands: env_usize("TERRAKEEP_MAX_COMMANDS")
                .map(|v| v.clamp(1, 10_000))
                .unwrap_or(d.max_commands),
            command_delay: env_u64("TERRAKEEP_COMMAND_DELAY_MS")
                .map(|v| Duration::from_millis(v.min(10_000)))
                .unwrap_or(d.command_delay),
            stop_timeout: env_u64("TERRAKEEP_STOP_TIMEOUT_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 600)))
                .unwrap_or(d.stop_timeout),
            ready_timeout: env_u64("TERRAKEEP_READY_TIMEOUT_SEC")
                .map(|v| Duration::from_secs(v.clamp(5, 3600)))
                .unwrap_or(d.ready_timeout),
            console_max_lines: env_usize("TERRAKEEP_CONSOLE_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(d.console_max_lines),
            verbosity,
            correlator: CorrelatorConfig {
                sweep_interval: env_u64("TERRAKEEP_SWEEP_INTERVAL_MS")
                    .map(|v| Duration::from_millis(v.clamp(100, 60_000)))
                    .unwrap_or(dc.sweep_interval),
                stale_after: env_u64("TERRAKEEP_STALE_AFTER_SEC")
                    .map(|v| Duration::from_secs(v.clamp(1, 3600)))
                    .unwrap_or(dc.stale_after),
                dos_threshold: env_u64("TERRAKEEP_DOS_THRESHOLD")
                    .map(|v| v.clamp(1, 10_000) as u32)
                    .unwrap_or(dc.dos_threshold),
            },
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_server_expectations() {
        let c = SupervisorConfig::default();
        assert_eq!(c.max_commands, 500);
        assert_eq!(c.command_delay, Duration::from_millis(500));
        assert_eq!(c.stop_timeout, Duration::from_secs(30));
        assert_eq!(c.correlator.sweep_interval, Duration::from_secs(5));
        assert_eq!(c.correlator.stale_after, Duration::from_secs(30));
        assert_eq!(c.correlator.dos_threshold, 25);
    }

    #[test]
    fn verbosity_parses_names_and_levels() {
        assert_eq!(Verbosity::parse("Quiet"), Some(Verbosity::Quiet));
        assert_eq!(Verbosity::parse(" 1 "), Some(Verbosity::Normal));
        assert_eq!(Verbosity::parse("debug"), Some(Verbosity::Verbose));
        assert_eq!(Verbosity::parse("loud"), None);
    }

    #[test]
    fn unset_env_var_is_none() {
        assert_eq!(env_u64("TERRAKEEP_TEST_SURELY_UNSET_VAR"), None);
        assert_eq!(env_usize("TERRAKEEP_TEST_SURELY_UNSET_VAR"), None);
    }
}
