//! Running IPAM plugin binaries.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::{env, thread};

use serde_json::Value;
use tracing::debug;
use unshare::{Command, Stdio};

use super::{IpamError, IpamOutput};
use crate::network::cni::args::Environment;
use crate::network::cni::schema::ERR_CODE_GENERIC;

/// Finds the plugin binary named `plugin_type` in the colon-separated `cni_path`.
pub fn find_plugin(plugin_type: &str, cni_path: &str) -> Result<PathBuf, IpamError> {
    for dir in cni_path.split(':').filter(|dir| !dir.is_empty()) {
        debug!("Looking for plugin {} in path {}", plugin_type, dir);
        let candidate = Path::new(dir).join(plugin_type);
        if candidate.is_file() {
            debug!("Found plugin {} in path {}", plugin_type, dir);
            return Ok(absolute(candidate));
        }
    }
    Err(IpamError::PluginNotFound {
        plugin_type: plugin_type.into(),
        cni_path: cni_path.into(),
    })
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

fn build_command(path: &Path, env: &Environment) -> Command {
    let mut command = Command::new(path);
    command.env_clear();
    for (key, value) in env {
        command.env(key, value);
    }
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command
}

/// Runs a plugin with `env` as its entire environment and `config` on stdin, collecting what it prints.
#[tracing::instrument(skip(env, config))]
pub fn run_plugin(path: &Path, env: &Environment, config: &Value) -> Result<IpamOutput, IpamError> {
    debug!("Passing in environment to IPAM plugin: {:?}", env);
    let mut child = build_command(path, env).spawn().map_err(|error| IpamError::Exec {
        path: path.into(),
        error,
    })?;

    let io_error = |context: &str| {
        let context = format!("{} IPAM plugin {}", context, path.display());
        move |error| IpamError::Io { context, error }
    };

    // Drain stderr on its own thread so a chatty plugin can't block on a full pipe while we wait on stdout.
    let stderr = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf);
            buf
        })
    });

    if let Some(mut stdin) = child.stdin.take() {
        let body = serde_json::to_vec(config).expect("network configuration is always serializable");
        stdin.write_all(&body).map_err(io_error("could not write configuration to"))?;
    }

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)
            .map_err(io_error("could not read output of"))?;
    }

    let status = child.wait().map_err(io_error("could not wait for"))?;
    let stderr = stderr.and_then(|reader| reader.join().ok()).unwrap_or_default();
    debug!("IPAM plugin return code: {}", status);
    debug!("IPAM plugin output: \nstdout:\n{}\nstderr:\n{}", stdout, stderr);

    Ok(IpamOutput {
        code: status.code().unwrap_or(ERR_CODE_GENERIC as i32),
        output: stdout,
    })
}
