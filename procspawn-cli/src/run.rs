use std::ffi::OsString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use procspawn::{
    CapturedIos, Execution, Gid, Pid, SpawnRequest, StdioSlots, TerminationStatus, Uid,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{self, SpawnProfile};
use crate::error::{CliError, CliResult};

/// Spawn one program and report how it ended.
#[derive(Debug, Parser)]
#[command(name = "procspawn", version)]
pub struct SpawnArgs {
    /// Program to run; looked up in PATH when it contains no `/`
    pub program: OsString,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,

    /// YAML profile with default spawn options
    #[arg(long, env = "PROCSPAWN_PROFILE")]
    pub profile: Option<PathBuf>,

    /// Working directory of the child
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Extra environment entry (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_entry)]
    pub env: Vec<(String, String)>,

    /// Start from an empty environment
    #[arg(long)]
    pub clear_env: bool,

    #[arg(long)]
    pub uid: Option<u32>,

    #[arg(long)]
    pub gid: Option<u32>,

    /// Supplementary groups, comma separated
    #[arg(long, value_delimiter = ',')]
    pub groups: Vec<u32>,

    /// Run the child in a new session
    #[arg(long)]
    pub setsid: bool,

    /// Move the child into this process group (0 = new group)
    #[arg(long)]
    pub pgid: Option<i32>,

    /// Pipe and capture stdout and stderr instead of inheriting them
    #[arg(long)]
    pub capture: bool,

    /// Print a JSON report instead of forwarding output
    #[arg(long)]
    pub json: bool,
}

fn parse_env_entry(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("empty key in `{entry}`")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got `{entry}`")),
    }
}

impl SpawnArgs {
    fn flag_profile(&self) -> SpawnProfile {
        SpawnProfile {
            cwd: self.cwd.clone(),
            env: self.env.iter().cloned().collect(),
            clear_env: self.clear_env,
            uid: self.uid,
            gid: self.gid,
            groups: self.groups.clone(),
            setsid: self.setsid,
            pgid: self.pgid,
            capture: self.capture,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum StatusReport {
    Exited(i32),
    Signaled(i32),
}

impl From<TerminationStatus> for StatusReport {
    fn from(status: TerminationStatus) -> Self {
        match status {
            TerminationStatus::Exited(code) => Self::Exited(code),
            TerminationStatus::Signaled(signal) => Self::Signaled(signal),
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    pid: i32,
    status: StatusReport,
    stdout: Option<String>,
    stderr: Option<String>,
}

pub async fn run(args: SpawnArgs) -> CliResult<ExitCode> {
    let profile = match &args.profile {
        Some(path) => config::load(path).await?,
        None => SpawnProfile::default(),
    };
    let settings = profile.merge(args.flag_profile());
    let program = resolve_program(&args.program)?;
    let capture = settings.capture || args.json;

    let request = build_request(program, &args.args, &settings, capture)?;
    debug!(?request, "built spawn request");

    let exec = procspawn::spawn(request)?;
    info!(pid = %exec.pid(), "child started");

    let captured = if capture {
        Some(exec.capture_ios().await?)
    } else {
        None
    };
    let status = exec.wait().await?;
    info!(pid = %exec.pid(), %status, "child finished");

    if args.json {
        print_report(&exec, status, captured)?;
    } else if let Some(captured) = captured {
        std::io::stdout().write_all(&captured.stdout)?;
        std::io::stderr().write_all(&captured.stderr)?;
    }
    Ok(exit_code(status))
}

fn resolve_program(program: &OsString) -> CliResult<PathBuf> {
    if program.as_bytes().contains(&b'/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|source| CliError::Resolve {
        program: program.to_string_lossy().into_owned(),
        source,
    })
}

fn build_request(
    program: PathBuf,
    args: &[OsString],
    settings: &SpawnProfile,
    capture: bool,
) -> CliResult<SpawnRequest> {
    let mut request = SpawnRequest::new(program).args(args);

    if settings.clear_env {
        request = request.env_clear();
    }
    for (key, value) in &settings.env {
        request = request.env(key, value);
    }
    if let Some(cwd) = &settings.cwd {
        request = request.current_dir(cwd);
    }
    if let Some(uid) = settings.uid {
        request = request.uid(Uid::from_raw(uid));
    }
    if let Some(gid) = settings.gid {
        request = request.gid(Gid::from_raw(gid));
    }
    if !settings.groups.is_empty() {
        request = request.groups(settings.groups.iter().copied().map(Gid::from_raw));
    }
    if let Some(pgid) = settings.pgid {
        request = request.process_group(Pid::from_raw(pgid));
    }
    if settings.setsid {
        request = request.create_session(true);
    }
    if capture {
        let stdio = StdioSlots::new()
            .piped_stdout()
            .and_then(StdioSlots::piped_stderr)
            .map_err(procspawn::SpawnError::from)?;
        request = request.stdio(stdio);
    }
    Ok(request)
}

fn print_report(
    exec: &Execution,
    status: TerminationStatus,
    captured: Option<CapturedIos>,
) -> CliResult<()> {
    let (stdout, stderr) = match captured {
        Some(CapturedIos { stdout, stderr }) => (
            Some(String::from_utf8_lossy(&stdout).into_owned()),
            Some(String::from_utf8_lossy(&stderr).into_owned()),
        ),
        None => (None, None),
    };
    let report = Report {
        pid: exec.pid().as_raw(),
        status: status.into(),
        stdout,
        stderr,
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| CliError::Config(format!("serialize report: {e}")))?;
    println!("{json}");
    Ok(())
}

fn exit_code(status: TerminationStatus) -> ExitCode {
    ExitCode::from(exit_byte(status))
}

/// Mirror the child's outcome: its exit code, or 128 + signal number.
fn exit_byte(status: TerminationStatus) -> u8 {
    let code = match status {
        TerminationStatus::Exited(code) => code & 0xff,
        TerminationStatus::Signaled(signal) => (128 + signal).min(255),
    };
    u8::try_from(code).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_entry_splits_on_first_equals() {
        assert_eq!(
            parse_env_entry("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(
            parse_env_entry("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_entry("=value").is_err());
        assert!(parse_env_entry("NOEQUALS").is_err());
    }

    #[test]
    fn flags_parse_into_args() {
        let args = SpawnArgs::try_parse_from([
            "procspawn",
            "--env",
            "A=1",
            "--groups",
            "4,5",
            "--setsid",
            "--capture",
            "/bin/echo",
            "-n",
            "hi",
        ])
        .unwrap();
        assert_eq!(args.program, OsString::from("/bin/echo"));
        assert_eq!(args.args, vec![OsString::from("-n"), OsString::from("hi")]);
        assert_eq!(args.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(args.groups, vec![4, 5]);
        assert!(args.setsid);
        assert!(args.capture);
        assert!(!args.json);
    }

    #[test]
    fn slash_paths_skip_lookup() {
        assert_eq!(
            resolve_program(&OsString::from("./local-tool")).unwrap(),
            PathBuf::from("./local-tool")
        );
    }

    #[test]
    fn bare_name_is_found_in_path() {
        let resolved = resolve_program(&OsString::from("sh")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn exit_byte_mirrors_child() {
        assert_eq!(exit_byte(TerminationStatus::Exited(0)), 0);
        assert_eq!(exit_byte(TerminationStatus::Exited(3)), 3);
        assert_eq!(exit_byte(TerminationStatus::Exited(256 + 4)), 4);
        let sigkill = procspawn::Signal::SIGKILL as i32;
        assert_eq!(exit_byte(TerminationStatus::Signaled(sigkill)), 137);
    }

    #[test]
    fn json_report_shape() {
        let report = Report {
            pid: 42,
            status: StatusReport::Exited(0),
            stdout: Some("out".into()),
            stderr: None,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "pid": 42,
                "status": {"exited": 0},
                "stdout": "out",
                "stderr": null,
            })
        );
    }

    #[tokio::test]
    async fn capture_request_pipes_both_streams() {
        let settings = SpawnProfile {
            clear_env: true,
            ..SpawnProfile::default()
        };
        let request = build_request(
            PathBuf::from("/bin/sh"),
            &[OsString::from("-c"), OsString::from("printf x; printf y >&2")],
            &settings,
            true,
        )
        .unwrap();
        let exec = procspawn::spawn(request).unwrap();
        let captured = exec.capture_ios().await.unwrap();
        assert_eq!(captured.stdout, b"x");
        assert_eq!(captured.stderr, b"y");
        assert!(exec.wait().await.unwrap().is_success());
    }
}
