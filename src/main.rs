use clap::Parser;
use ims_connect::config::{split_host_port, AuthenticationMode, MinimumBatteryLevel, ProxyConfig, SimIdentity};
use ims_connect::{
    create_connection_manager, utils, HostNetworkMonitor, ImsConfig, ImsCoreListener, NetworkType, ReasonCode,
    RegistrationError, RegistrationListener, SipProtocol,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// IMS Connect CLI Application
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IMS proxy (P-CSCF) address (e.g., pcscf.example.com or 10.0.0.1:5060)
    #[arg(long, env = "IMS_PROXY")]
    proxy: String,

    /// Public user name (e.g., alice)
    #[arg(short, long, env = "IMS_USER")]
    username: String,

    /// Home domain (e.g., ims.example.com)
    #[arg(short, long, env = "IMS_DOMAIN")]
    domain: String,

    /// Digest password
    #[arg(short, long, env = "IMS_PASSWORD", default_value = "")]
    password: String,

    /// Private identity (defaults to user@domain)
    #[arg(long, env = "IMS_PRIVATE_ID")]
    private_id: Option<String>,

    /// Transport protocol (udp/tcp/tls)
    #[arg(long, default_value = "udp")]
    protocol: SipProtocol,

    /// Authentication mode (digest/giba)
    #[arg(short, long, default_value = "digest")]
    auth_mode: AuthenticationMode,

    /// SIM IMSI, required for GIBA
    #[arg(long, env = "IMS_IMSI")]
    imsi: Option<String>,

    /// Mobile country code, required for GIBA
    #[arg(long)]
    mcc: Option<u16>,

    /// Mobile network code, required for GIBA
    #[arg(long)]
    mnc: Option<u16>,

    /// Force the network type of the host interface (mobile/wifi)
    #[arg(short, long)]
    network: Option<NetworkType>,

    /// Authorized operator name (empty disables the check)
    #[arg(long, default_value = "")]
    operator: String,

    /// REGISTER expiry in seconds
    #[arg(short, long, default_value_t = 600)]
    expires: u32,

    /// Minimum battery level in percent (disabled when omitted)
    #[arg(long)]
    battery_level: Option<u8>,

    /// Interval in seconds between connectivity re-checks
    #[arg(long, default_value_t = 10)]
    watch_interval: u64,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// 把事件打到日志里的监听器
struct LoggingListener;

impl RegistrationListener for LoggingListener {
    fn on_registration_successful(&self) {
        info!("IMS registration successful");
    }

    fn on_registration_failed(&self, error: &RegistrationError) {
        error!("IMS registration failed: {}", error);
        error!("Error code: {}", error.error_code());
    }

    fn on_registration_terminated(&self, reason: ReasonCode) {
        warn!("IMS registration terminated: {}", reason);
    }
}

impl ImsCoreListener for LoggingListener {
    fn is_initialization_finished(&self) -> bool {
        true
    }

    fn start_services(&self) {
        info!("IMS services started");
    }

    fn stop_services(&self) {
        info!("IMS services stopped");
    }

    fn check_services(&self) {
        info!("IMS services checked");
    }

    fn on_sim_changed(&self) {
        warn!("SIM card has changed");
    }
}

fn build_config(args: &Args) -> Result<ImsConfig, Box<dyn std::error::Error>> {
    let (host, port) = split_host_port(&args.proxy)?;
    let proxy = ProxyConfig::new(host, port, args.protocol).with_auth_mode(args.auth_mode);

    let mut config = ImsConfig::new(&args.proxy, &args.username, &args.domain, &args.password)?
        .with_mobile_proxy(proxy.clone())
        .with_wifi_proxy(proxy)
        .with_operator(args.operator.clone())
        .with_expire_period(args.expires);
    if let Some(private_id) = &args.private_id {
        config.user.private_id = private_id.clone();
    }
    if let Some(level) = args.battery_level {
        config = config.with_min_battery_level(MinimumBatteryLevel::Percent(level));
    }

    if args.auth_mode == AuthenticationMode::Giba {
        let (Some(imsi), Some(mcc), Some(mnc)) = (args.imsi.clone(), args.mcc, args.mnc) else {
            return Err("GIBA requires --imsi, --mcc and --mnc".into());
        };
        config = config.with_sim(SimIdentity { imsi, mcc, mnc });
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    let config = build_config(&args)?;
    info!(
        "Starting IMS connection for {}@{} via {} ({}, {:?})",
        args.username, args.domain, args.proxy, args.protocol, args.auth_mode
    );

    let mut monitor = HostNetworkMonitor::new(args.operator.clone(), None);
    if let Some(network) = args.network {
        monitor = monitor.with_network_type(network);
    }
    let manager = create_connection_manager(config, monitor, Arc::new(LoggingListener))?;

    // 本机没有连接事件，按固定间隔重新检查
    let watcher = manager.clone();
    let interval = Duration::from_secs(args.watch_interval.max(1));
    let watch = tokio::spawn(async move {
        loop {
            watcher.connection_event().await;
            tokio::time::sleep(interval).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    watch.abort();
    manager.terminate().await;

    Ok(())
}
