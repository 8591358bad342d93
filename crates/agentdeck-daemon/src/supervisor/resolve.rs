//! Agent executable resolution.
//!
//! Desktop launchers often start the supervisor with a minimal `PATH`, and
//! agent CLIs are frequently `#!/usr/bin/env node` scripts installed by a
//! version manager. Resolution therefore searches the child's `PATH`, the
//! configured extra directories and a list of well-known install locations,
//! then reads the script header once to decide how to launch it.

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::SupervisorError;

/// Bytes read when probing for a `#!` line.
const HEADER_READ_LEN: usize = 256;

/// How a resolved executable is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Execute the file itself.
    Direct,
    /// Run `interpreter [leading_args..] <executable> args..`.
    Interpreter {
        interpreter: PathBuf,
        leading_args: Vec<String>,
    },
}

/// Result of resolving the agent executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub executable: PathBuf,
    pub strategy: LaunchStrategy,
    /// Interpreter located in a fallback directory, used for the single
    /// retry after a refused direct launch.
    pub fallback_interpreter: Option<PathBuf>,
    pub searched: Vec<PathBuf>,
}

impl LaunchPlan {
    /// Program and full argument vector for this plan.
    pub fn command_line(&self, args: &[String]) -> (PathBuf, Vec<OsString>) {
        match &self.strategy {
            LaunchStrategy::Direct => (
                self.executable.clone(),
                args.iter().map(OsString::from).collect(),
            ),
            LaunchStrategy::Interpreter {
                interpreter,
                leading_args,
            } => {
                let mut argv: Vec<OsString> = leading_args.iter().map(OsString::from).collect();
                argv.push(self.executable.clone().into_os_string());
                argv.extend(args.iter().map(OsString::from));
                (interpreter.clone(), argv)
            }
        }
    }

    /// The interpreter variant of a direct plan, if a fallback exists.
    pub fn with_interpreter(&self) -> Option<Self> {
        if !matches!(self.strategy, LaunchStrategy::Direct) {
            return None;
        }
        let interpreter = self.fallback_interpreter.clone()?;
        Some(Self {
            strategy: LaunchStrategy::Interpreter {
                interpreter,
                leading_args: Vec::new(),
            },
            ..self.clone()
        })
    }

    /// Directories the child needs on its `PATH` for this plan to work.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let LaunchStrategy::Interpreter { interpreter, .. } = &self.strategy
            && let Some(parent) = interpreter.parent()
        {
            dirs.push(parent.to_path_buf());
        }
        if let Some(parent) = self.executable.parent() {
            dirs.push(parent.to_path_buf());
        }
        dirs.retain(|d| !d.as_os_str().is_empty());
        dirs.dedup();
        dirs
    }

    /// Shell-like rendering for diagnostics.
    pub fn describe(&self, args: &[String]) -> String {
        let (program, argv) = self.command_line(args);
        let mut out = program.display().to_string();
        for arg in argv {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

/// Locates the configured agent binary.
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    program: String,
    extra_dirs: Vec<PathBuf>,
    fallback_dirs: Vec<PathBuf>,
}

impl ExecutableResolver {
    pub fn new(program: impl Into<String>, extra_dirs: Vec<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_dirs,
            fallback_dirs: default_fallback_dirs(),
        }
    }

    /// Replace the platform install locations.
    #[must_use]
    pub fn with_fallback_dirs(mut self, fallback_dirs: Vec<PathBuf>) -> Self {
        self.fallback_dirs = fallback_dirs;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Resolve against the child's search path (`PATH` as the child will
    /// see it).
    pub fn resolve(&self, search_path: Option<&OsStr>) -> Result<LaunchPlan, SupervisorError> {
        let path_dirs: Vec<PathBuf> = search_path
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();
        let fallback: Vec<PathBuf> = dedup(
            self.extra_dirs
                .iter()
                .chain(self.fallback_dirs.iter())
                .cloned()
                .collect(),
        );
        let searched = dedup(path_dirs.iter().chain(fallback.iter()).cloned().collect());

        let explicit = Path::new(&self.program);
        let executable = if explicit.is_absolute() || explicit.components().count() > 1 {
            if explicit.is_file() {
                explicit.to_path_buf()
            } else {
                return Err(SupervisorError::ExecutableNotFound {
                    program: self.program.clone(),
                    searched: vec![explicit.to_path_buf()],
                });
            }
        } else {
            find_in(&self.program, &searched).ok_or_else(|| {
                SupervisorError::ExecutableNotFound {
                    program: self.program.clone(),
                    searched: searched.clone(),
                }
            })?
        };

        let plan = plan_launch(executable, &path_dirs, &fallback, searched);
        debug!(
            executable = %plan.executable.display(),
            strategy = ?plan.strategy,
            "Resolved agent executable"
        );
        Ok(plan)
    }
}

fn plan_launch(
    executable: PathBuf,
    path_dirs: &[PathBuf],
    fallback_dirs: &[PathBuf],
    searched: Vec<PathBuf>,
) -> LaunchPlan {
    #[cfg(windows)]
    if let Some(strategy) = windows_shim(&executable) {
        return LaunchPlan {
            executable,
            strategy,
            fallback_interpreter: None,
            searched,
        };
    }

    let Some(shebang) = read_shebang(&executable) else {
        return LaunchPlan {
            executable,
            strategy: LaunchStrategy::Direct,
            fallback_interpreter: None,
            searched,
        };
    };

    let available = if shebang.via_env {
        find_in(&shebang.name, path_dirs).is_some()
    } else {
        Path::new(&shebang.interpreter).is_file()
    };
    let fallback_interpreter = find_in(&shebang.name, fallback_dirs)
        .or_else(|| (!shebang.via_env).then(|| find_in(&shebang.name, path_dirs)).flatten());

    let strategy = match (&fallback_interpreter, available) {
        (Some(interpreter), false) => LaunchStrategy::Interpreter {
            interpreter: interpreter.clone(),
            leading_args: Vec::new(),
        },
        _ => LaunchStrategy::Direct,
    };

    LaunchPlan {
        executable,
        strategy,
        fallback_interpreter,
        searched,
    }
}

#[cfg(windows)]
fn windows_shim(executable: &Path) -> Option<LaunchStrategy> {
    let ext = executable.extension()?.to_string_lossy().to_ascii_lowercase();
    if ext != "cmd" && ext != "bat" {
        return None;
    }
    let comspec = std::env::var_os("COMSPEC").map_or_else(|| PathBuf::from("cmd.exe"), PathBuf::from);
    Some(LaunchStrategy::Interpreter {
        interpreter: comspec,
        leading_args: vec!["/C".to_string()],
    })
}

#[derive(Debug, PartialEq, Eq)]
struct Shebang {
    /// Interpreter as written on the `#!` line.
    interpreter: String,
    /// Bare program name used for lookups.
    name: String,
    via_env: bool,
}

fn read_shebang(path: &Path) -> Option<Shebang> {
    let mut header = [0u8; HEADER_READ_LEN];
    let mut file = std::fs::File::open(path).ok()?;
    let n = file.read(&mut header).ok()?;
    parse_shebang(&header[..n])
}

fn parse_shebang(header: &[u8]) -> Option<Shebang> {
    let rest = header.strip_prefix(b"#!")?;
    let line_end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let line = String::from_utf8_lossy(&rest[..line_end]);
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;

    let is_env = Path::new(first).file_name().is_some_and(|n| n == "env");
    if is_env {
        let name = tokens.find(|t| !t.starts_with('-'))?;
        return Some(Shebang {
            interpreter: name.to_string(),
            name: name.to_string(),
            via_env: true,
        });
    }

    let name = Path::new(first).file_name()?.to_string_lossy().into_owned();
    Some(Shebang {
        interpreter: first.to_string(),
        name,
        via_env: false,
    })
}

fn find_in(program: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if dirs.is_empty() {
        return None;
    }
    // Directories containing the separator cannot be joined; skip them.
    let usable: Vec<&PathBuf> = dirs
        .iter()
        .filter(|d| std::env::join_paths([d.as_os_str()]).is_ok())
        .collect();
    let joined = std::env::join_paths(usable).ok()?;
    let cwd = std::env::current_dir().unwrap_or_default();
    which::which_in(program, Some(joined), cwd).ok()
}

fn dedup(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::with_capacity(dirs.len());
    for dir in dirs {
        if !out.contains(&dir) {
            out.push(dir);
        }
    }
    out
}

/// Well-known install locations for agent CLIs and their interpreters.
pub fn default_fallback_dirs() -> Vec<PathBuf> {
    let mut out = Vec::new();

    if let Some(home) = dirs::home_dir() {
        for rel in [
            ".local/bin",
            ".claude/local",
            ".npm-global/bin",
            ".bun/bin",
            ".volta/bin",
            ".cargo/bin",
        ] {
            out.push(home.join(rel));
        }
        // Newest nvm-managed node first.
        if let Ok(entries) = std::fs::read_dir(home.join(".nvm/versions/node")) {
            let mut versions: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path().join("bin"))
                .collect();
            versions.sort();
            out.extend(versions.into_iter().rev());
        }
    }

    #[cfg(unix)]
    for dir in ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"] {
        out.push(PathBuf::from(dir));
    }

    #[cfg(windows)]
    {
        if let Some(roaming) = dirs::data_dir() {
            out.push(roaming.join("npm"));
        }
        if let Some(local) = dirs::data_local_dir() {
            out.push(local.join("Programs").join("nodejs"));
        }
        out.push(PathBuf::from(r"C:\Program Files\nodejs"));
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn shebang_env_form_skips_flags() {
        let parsed = parse_shebang(b"#!/usr/bin/env -S node --no-warnings\nconsole.log(1)").unwrap();
        assert_eq!(parsed.name, "node");
        assert!(parsed.via_env);
    }

    #[test]
    fn shebang_direct_form_keeps_path() {
        let parsed = parse_shebang(b"#!/usr/local/bin/node\n").unwrap();
        assert_eq!(parsed.interpreter, "/usr/local/bin/node");
        assert_eq!(parsed.name, "node");
        assert!(!parsed.via_env);
    }

    #[test]
    fn binaries_have_no_shebang() {
        assert!(parse_shebang(b"\x7fELF\x02\x01").is_none());
        assert!(parse_shebang(b"").is_none());
    }

    #[test]
    fn interpreter_plan_prepends_interpreter() {
        let plan = LaunchPlan {
            executable: PathBuf::from("/opt/agent/cli.js"),
            strategy: LaunchStrategy::Direct,
            fallback_interpreter: Some(PathBuf::from("/opt/node/bin/node")),
            searched: Vec::new(),
        };
        let retry = plan.with_interpreter().unwrap();
        let (program, argv) = retry.command_line(&["-p".to_string(), "hi".to_string()]);
        assert_eq!(program, PathBuf::from("/opt/node/bin/node"));
        assert_eq!(argv, vec!["/opt/agent/cli.js", "-p", "hi"]);
        assert!(retry.with_interpreter().is_none());
        assert_eq!(
            retry.required_dirs(),
            vec![PathBuf::from("/opt/node/bin"), PathBuf::from("/opt/agent")]
        );
    }

    #[test]
    fn missing_program_lists_search_locations() {
        let resolver = ExecutableResolver::new("agentdeck-no-such-agent", vec![PathBuf::from("/nonexistent-extra")])
            .with_fallback_dirs(vec![PathBuf::from("/nonexistent-fallback")]);
        let err = resolver
            .resolve(Some(OsStr::new("/nonexistent-path")))
            .unwrap_err();
        match err {
            SupervisorError::ExecutableNotFound { program, searched } => {
                assert_eq!(program, "agentdeck-no-such-agent");
                assert_eq!(
                    searched,
                    vec![
                        PathBuf::from("/nonexistent-path"),
                        PathBuf::from("/nonexistent-extra"),
                        PathBuf::from("/nonexistent-fallback"),
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_exec(path: &Path, body: &str) {
            std::fs::write(path, body).unwrap();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[test]
        fn script_with_missing_interpreter_uses_fallback_dir() {
            let bin = tempfile::tempdir().unwrap();
            let fallback = tempfile::tempdir().unwrap();
            write_exec(
                &bin.path().join("fake-agent"),
                "#!/usr/bin/env agentdeck-fake-node\necho hi\n",
            );
            write_exec(
                &fallback.path().join("agentdeck-fake-node"),
                "#!/bin/sh\nexec /bin/sh \"$@\"\n",
            );

            let resolver = ExecutableResolver::new("fake-agent", Vec::new())
                .with_fallback_dirs(vec![fallback.path().to_path_buf()]);
            let plan = resolver.resolve(Some(bin.path().as_os_str())).unwrap();

            assert_eq!(plan.executable, bin.path().join("fake-agent"));
            assert_eq!(
                plan.strategy,
                LaunchStrategy::Interpreter {
                    interpreter: fallback.path().join("agentdeck-fake-node"),
                    leading_args: Vec::new(),
                }
            );
        }

        #[test]
        fn interpreter_on_child_path_launches_directly() {
            let bin = tempfile::tempdir().unwrap();
            write_exec(
                &bin.path().join("fake-agent"),
                "#!/usr/bin/env agentdeck-fake-node\necho hi\n",
            );
            write_exec(&bin.path().join("agentdeck-fake-node"), "#!/bin/sh\n");

            let resolver =
                ExecutableResolver::new("fake-agent", Vec::new()).with_fallback_dirs(Vec::new());
            let plan = resolver.resolve(Some(bin.path().as_os_str())).unwrap();
            assert_eq!(plan.strategy, LaunchStrategy::Direct);
        }

        #[test]
        fn absolute_program_is_used_as_is() {
            let resolver = ExecutableResolver::new("/bin/sh", Vec::new()).with_fallback_dirs(Vec::new());
            let plan = resolver.resolve(None).unwrap();
            assert_eq!(plan.executable, PathBuf::from("/bin/sh"));
        }
    }
}
