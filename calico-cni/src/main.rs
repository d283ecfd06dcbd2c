use std::any::Any;
use std::env;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{debug, info};

mod config;
mod datastore;
mod engine;
mod error;
mod ipam;
mod kubernetes;
mod logging;
mod network;
mod plugin;
mod policy;
#[cfg(test)]
mod testing;

use datastore::etcd::{EtcdClient, EtcdConfig};
use engine::{ContainerEngine, DefaultEngine, DockerEngine};
use error::{report, Error};
use ipam::DefaultIpamInvoker;
use logging::LogSettings;
use network::cni::args::{Environment, RequestContext};
use network::cni::schema::NetworkConfiguration;
use network::veth::IpVethManager;
use plugin::CniPluginBuilder;

/// Name the binary is installed under to act as an IPAM plugin.
const IPAM_BINARY_NAME: &str = "calico-ipam";

const VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMIT: Option<&str> = option_env!("CALICO_GIT_COMMIT");
const BRANCH: Option<&str> = option_env!("CALICO_GIT_BRANCH");

/// Calico networking for containers. Configuration is read from stdin and the
/// request from the CNI_* environment variables.
#[derive(Debug, Parser)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Print the plugin version
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() {
    let cli = Cli::parse();
    if cli.version {
        let version = json!({
            "Version": VERSION,
            "Commit": COMMIT.unwrap_or("unknown"),
            "Branch": BRANCH.unwrap_or("unknown"),
        });
        println!("{:#}", version);
        return;
    }

    let code = match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(code) => code,
        Err(payload) => report(Error::Panic(panic_message(payload.as_ref())), io::stdout().lock()),
    };
    process::exit(code);
}

fn invoked_as_ipam() -> bool {
    env::args_os()
        .next()
        .as_ref()
        .and_then(|arg0| Path::new(arg0).file_name().map(|name| name == IPAM_BINARY_NAME))
        .unwrap_or(false)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}

fn run() -> i32 {
    let as_ipam = invoked_as_ipam();
    let settings = |config: Option<&NetworkConfiguration>| {
        if as_ipam {
            LogSettings::for_ipam(config)
        } else {
            LogSettings::for_plugin(config)
        }
    };

    let (raw, config) = match config::read_network_config(io::stdin().lock()) {
        Ok(config) => config,
        Err(err) => {
            logging::init(&settings(None));
            return report(err.into(), io::stdout().lock());
        }
    };
    logging::init(&settings(Some(&config)));

    let mut env: Environment = env::vars().collect();
    config::export_etcd_settings(&config, &mut env);
    debug!("Network config: {}", raw);

    let outcome = if as_ipam {
        run_ipam(&raw, &config, &env)
    } else {
        run_plugin(&raw, &config, &env)
    };
    let code = outcome.unwrap_or_else(|err| report(err, io::stdout().lock()));

    let _ = io::stdout().flush();
    code
}

fn connect(config: &NetworkConfiguration, env: &Environment) -> Result<EtcdClient, Error> {
    EtcdConfig::new(config, env)
        .and_then(|etcd| EtcdClient::new(&etcd))
        .map_err(|err| Error::datastore("could not configure datastore", err))
}

fn run_ipam(raw: &Value, config: &NetworkConfiguration, env: &Environment) -> Result<i32, Error> {
    let datastore = connect(config, env)?;
    let code = ipam::calico::run_standalone(env, raw, &datastore, io::stdout().lock());
    info!("Calico IPAM execution complete, rc={}", code);
    Ok(code)
}

fn run_plugin(raw: &Value, config: &NetworkConfiguration, env: &Environment) -> Result<i32, Error> {
    let ctx = RequestContext::new(env, config)?;

    let span = tracing::info_span!("cni", id = %ctx.identity());
    let _entered = span.enter();
    info!("Starting Calico CNI plugin execution");
    debug!("CNI_ARGS: {:?}", ctx.cni_args);

    let hostname = config::hostname(config)?;
    let datastore = connect(config, env)?;
    let policy = policy::build_policy_driver(config, &ctx, &datastore)?;
    let ipam = DefaultIpamInvoker::new(&ctx.ipam_type, &ctx.cni_path, &datastore);
    let engine: Box<dyn ContainerEngine> = if ctx.running_under_k8s() {
        Box::new(DockerEngine::default())
    } else {
        Box::new(DefaultEngine)
    };
    let veth = IpVethManager::default();

    let plugin = CniPluginBuilder::default()
        .config(raw)
        .ctx(&ctx)
        .hostname(hostname)
        .datastore(&datastore)
        .ipam(&ipam)
        .policy(policy.as_ref())
        .veth(&veth)
        .engine(engine.as_ref())
        .build()
        .expect("all plugin collaborators are set");

    let code = plugin.execute(io::stdout().lock());
    info!("Calico CNI execution complete, rc={}", code);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = panic::catch_unwind(|| panic!("{} failed", "setup")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "setup failed");
    }

    #[test]
    fn test_version_flag() {
        assert!(Cli::try_parse_from(["calico", "-v"]).unwrap().version);
        assert!(Cli::try_parse_from(["calico", "--version"]).unwrap().version);
        assert!(!Cli::try_parse_from(["calico"]).unwrap().version);
    }
}
