//! Invocation of the external schema compiler.

use crate::config::SchemaCompilerConfig;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

#[derive(Debug, thiserror::Error)]
pub enum ExternalProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error("{program} timed out after {after:?} and was killed")]
    TimedOut { program: PathBuf, after: Duration },

    #[error("I/O error while waiting for {program}: {source}")]
    Wait {
        program: PathBuf,
        source: std::io::Error,
    },
}

/// Output of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct SchemaCompiler {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl SchemaCompiler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &SchemaCompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `program args… <schema> -o <out_dir>` and wait at most the
    /// configured timeout.
    pub fn compile(&self, schema: &Path, out_dir: &Path) -> Result<CompilerOutput, ExternalProcessError> {
        let start = Instant::now();
        tracing::info!(program = %self.program.display(), schema = %schema.display(), "schema compiler started");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(schema)
            .arg("-o")
            .arg(out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExternalProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Both pipes are drained while waiting, so a chatty compiler cannot
        // fill a pipe buffer and stall until the timeout.
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let wait_err = |source| ExternalProcessError::Wait {
            program: self.program.clone(),
            source,
        };
        let Some(status) = child.wait_timeout(self.timeout).map_err(wait_err)? else {
            let _ = child.kill();
            let _ = child.wait();
            // The readers are left to finish on their own: a grandchild may
            // still hold the pipes open.
            tracing::warn!(program = %self.program.display(), after = ?self.timeout, "schema compiler timed out");
            return Err(ExternalProcessError::TimedOut {
                program: self.program.clone(),
                after: self.timeout,
            });
        };

        let stdout = collect(stdout_reader).map_err(wait_err)?;
        let stderr = collect(stderr_reader).map_err(wait_err)?;

        let elapsed = start.elapsed();
        if !status.success() {
            tracing::warn!(program = %self.program.display(), %status, "schema compiler failed");
            return Err(ExternalProcessError::Failed {
                program: self.program.clone(),
                status,
                stdout,
                stderr,
            });
        }
        tracing::info!(program = %self.program.display(), elapsed_ms = elapsed.as_millis() as u64, "schema compiler finished");
        Ok(CompilerOutput {
            stdout,
            stderr,
            elapsed,
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

/// Output is decoded lossily; compilers are free to print non-UTF-8 bytes.
fn collect(reader: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<String> {
    let bytes = reader
        .join()
        .map_err(|_| io::Error::other("output reader panicked"))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::loader::tests::{cleanup, make_test_dir};

    fn sh(script: &str) -> SchemaCompiler {
        SchemaCompiler::new("sh").arg("-c").arg(script).arg("compiler")
    }

    #[test]
    fn successful_run_captures_output() {
        let dir = make_test_dir("compiler_ok");
        // $1 is the schema path, $3 the output directory.
        let out = sh("echo compiled $1; touch \"$3/out.rs\"")
            .compile(Path::new("schema.fbs"), &dir)
            .unwrap();
        assert_eq!(out.stdout.trim(), "compiled schema.fbs");
        assert!(dir.join("out.rs").is_file());
        cleanup(&dir);
    }

    #[test]
    fn non_zero_exit_is_failed() {
        let err = sh("echo broken >&2; exit 3")
            .compile(Path::new("schema.fbs"), Path::new("."))
            .unwrap_err();
        match err {
            ExternalProcessError::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn large_output_does_not_stall() {
        let out = sh("head -c 200000 /dev/zero | tr '\\0' a; head -c 100000 /dev/zero | tr '\\0' b >&2")
            .timeout(Duration::from_secs(10))
            .compile(Path::new("schema.fbs"), Path::new("."))
            .unwrap();
        assert_eq!(out.stdout.len(), 200_000);
        assert_eq!(out.stderr.len(), 100_000);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn non_utf8_output_is_decoded_lossily() {
        let out = sh("printf 'ok\\377'")
            .compile(Path::new("schema.fbs"), Path::new("."))
            .unwrap();
        assert_eq!(out.stdout, "ok\u{FFFD}");
    }

    #[test]
    fn slow_compiler_times_out() {
        let err = sh("sleep 5")
            .timeout(Duration::from_millis(100))
            .compile(Path::new("schema.fbs"), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ExternalProcessError::TimedOut { .. }));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = SchemaCompiler::new("/nonexistent/paramforge-compiler")
            .compile(Path::new("schema.fbs"), Path::new("."))
            .unwrap_err();
        assert!(matches!(err, ExternalProcessError::Spawn { .. }));
    }
}
