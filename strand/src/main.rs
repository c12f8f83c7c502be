use std::{fs, net::ToSocketAddrs, path::PathBuf, process, sync::Arc};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_server::{wpool::WorkerFactory, Builder};

use strand::{
    access_log::AccessLog,
    config::{Config, ListenConfig},
    service::{worker_env, ListenerService},
};

#[derive(Parser)]
#[command(name = "strand", version, about = "http/1.1 web server and reverse proxy")]
struct Args {
    /// configuration file
    #[arg(short, long, default_value = "strand_config.json")]
    config: PathBuf,

    /// override the first listen entry's address
    #[arg(short, long)]
    listen: Option<String>,

    /// log level filter (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// access log file
    #[arg(short = 'a', long)]
    access_log: Option<PathBuf>,

    /// pid file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// number of event workers
    #[arg(short = 'w', long)]
    workers: Option<usize>,
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("strand: {e}");
            return 1;
        }
    };

    apply_cli_overrides(&mut config, &args);

    let filter = config
        .log_level
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.listen.is_empty() {
        warn!("no listen entry configured; defaulting to 0.0.0.0:8055");
        config.listen.push(default_listen());
    }

    if config.drop_privileges.is_some() {
        warn!("drop_privileges is configured but not supported by this build; ignored");
    }

    let access_log = match AccessLog::open(config.access_log.as_deref()) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("strand: can't open access log: {e}");
            return 1;
        }
    };

    #[cfg(feature = "rustls")]
    let tls_configs = match tls::load_all(&config.listen) {
        Ok(map) => map,
        Err(e) => {
            eprintln!("strand: {e}");
            return 1;
        }
    };

    let mut builder = Builder::new();
    if let Some(workers) = config.worker_threads {
        builder = builder.worker_threads(workers);
    }

    for listen in &config.listen {
        let addr = match listen.address.to_socket_addrs().ok().and_then(|mut it| it.next()) {
            Some(addr) => addr,
            None => {
                eprintln!("strand: listen address {:?} did not resolve", listen.address);
                return 1;
            }
        };

        if let Some(backlog) = listen.backlog {
            builder = builder.backlog(backlog);
        }

        builder = match builder.bind(&listen.name, addr) {
            Ok(builder) => builder,
            Err(e) => {
                eprintln!("strand: can't bind {}: {e}", listen.address);
                return 1;
            }
        };

        info!("listening on {} ({})", listen.address, listen.name);
    }

    if let Some(ref path) = config.pid_file {
        if let Err(e) = fs::write(path, format!("{}\n", process::id())) {
            eprintln!("strand: can't write pid file {}: {e}", path.display());
            return 1;
        }
    }

    let pid_file = config.pid_file.clone();
    let wpool = WorkerFactory::default();
    let config = Arc::new(config);

    let server = {
        let config = config.clone();
        let wpool = wpool.clone();
        #[cfg(feature = "rustls")]
        let tls_configs = Arc::new(tls_configs);

        builder.build(move |name| {
            let listen = config
                .listen
                .iter()
                .find(|listen| listen.name == name)
                .expect("listener name out of config");

            let env = worker_env(&wpool, &access_log);

            #[cfg(feature = "rustls")]
            let service = ListenerService::new(&config, listen, env, tls_configs.get(name).cloned());
            #[cfg(not(feature = "rustls"))]
            let service = ListenerService::new(&config, listen, env);

            service
        })
    };

    let server = match server {
        Ok(server) => server,
        Err(e) => {
            eprintln!("strand: {e}");
            return 1;
        }
    };

    let result = server.run_until_signal();

    wpool.shutdown();
    if let Some(path) = pid_file {
        let _ = fs::remove_file(path);
    }

    match result {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("strand: {e}");
            1
        }
    }
}

fn apply_cli_overrides(config: &mut Config, args: &Args) {
    if let Some(ref listen) = args.listen {
        match config.listen.first_mut() {
            Some(entry) => entry.address = listen.clone(),
            None => {
                let mut entry = default_listen();
                entry.address = listen.clone();
                config.listen.push(entry);
            }
        }
    }
    if args.log_level.is_some() {
        config.log_level = args.log_level.clone();
    }
    if args.access_log.is_some() {
        config.access_log = args.access_log.clone();
    }
    if args.pid_file.is_some() {
        config.pid_file = args.pid_file.clone();
    }
    if args.workers.is_some() {
        config.worker_threads = args.workers;
    }
}

fn default_listen() -> ListenConfig {
    ListenConfig {
        name: "http".into(),
        address: "0.0.0.0:8055".into(),
        backlog: None,
        secure: false,
        cert: None,
        key: None,
    }
}

#[cfg(feature = "rustls")]
mod tls {
    use std::{collections::HashMap, fmt, fs::File, io::BufReader, sync::Arc};

    use strand::config::ListenConfig;

    pub(super) struct TlsSetupError(String);

    impl fmt::Display for TlsSetupError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    pub(super) fn load_all(
        listeners: &[ListenConfig],
    ) -> Result<HashMap<String, Arc<rustls::ServerConfig>>, TlsSetupError> {
        let mut map = HashMap::new();
        for listen in listeners {
            if listen.secure {
                map.insert(listen.name.clone(), load_one(listen)?);
            }
        }
        Ok(map)
    }

    fn load_one(listen: &ListenConfig) -> Result<Arc<rustls::ServerConfig>, TlsSetupError> {
        let fail = |msg: String| TlsSetupError(format!("listener {:?}: {msg}", listen.name));

        let cert_path = listen.cert.as_ref().expect("validated by config load");
        let key_path = listen.key.as_ref().expect("validated by config load");

        let certs = rustls_pemfile::certs(&mut BufReader::new(
            File::open(cert_path).map_err(|e| fail(format!("can't open cert: {e}")))?,
        ))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| fail(format!("can't parse cert: {e}")))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(
            File::open(key_path).map_err(|e| fail(format!("can't open key: {e}")))?,
        ))
        .map_err(|e| fail(format!("can't parse key: {e}")))?
        .ok_or_else(|| fail("no private key found".into()))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| fail(format!("invalid certificate: {e}")))?;

        Ok(Arc::new(config))
    }
}
