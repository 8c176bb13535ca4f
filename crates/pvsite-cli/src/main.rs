use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pvsite_core::influx::InfluxSink;
use pvsite_core::keys;
use pvsite_core::mqtt::MqttSink;
use pvsite_core::sma::SmaClient;
use pvsite_core::solar::{clearsky_irradiance, is_daylight};
use pvsite_core::{
    Astronomical, DeviceClient, Dispatcher, Mode, Poller, SchedulerSettings, SiteCache,
    SiteConfig, SiteContext, SiteSnapshot, Sink, SolarModel, TierScheduler,
};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod archive;

#[derive(Debug, Parser)]
#[command(name = "pvsited")]
#[command(about = "Multi-rate sampler for SMA WebConnect inverter sites")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "PVSITE_CONFIG", default_value = "./pvsite.yaml")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print the tier plan.
    Check,
    /// Poll every inverter once and print the site snapshot.
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Print the current sun position for the site.
    Sun {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Run the sampler until ctrl-c.
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = SiteConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Check => print_plan(&config)?,
        Command::Once { format } => {
            let devices = build_devices(&config)?;
            let cache = Arc::new(SiteCache::new(config.inverters.iter().map(|i| i.name.clone())));
            let poller = Poller::new(
                devices,
                cache.clone(),
                config.poll_timeout(),
                config.sampling.stale_after_failures,
            );
            poller.poll_all().await;
            poller.close_all().await;
            print_snapshot(&cache.read(), format)?;
        }
        Command::Sun { format } => print_sun(&config, format)?,
        Command::Run => run(config).await?,
    }

    Ok(())
}

fn build_devices(config: &SiteConfig) -> Result<Vec<Arc<dyn DeviceClient>>> {
    config
        .inverters
        .iter()
        .map(|inverter| {
            let client = SmaClient::new(inverter)
                .with_context(|| format!("creating client for {}", inverter.name))?;
            Ok(Arc::new(client) as Arc<dyn DeviceClient>)
        })
        .collect()
}

fn build_sinks(config: &SiteConfig) -> Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if let Some(mqtt) = config.mqtt.as_ref().filter(|m| m.enable) {
        info!(host = %mqtt.host, port = mqtt.port, "MQTT sink enabled");
        sinks.push(Arc::new(MqttSink::connect(mqtt)));
    }
    if let Some(influx) = config.influxdb2.as_ref().filter(|i| i.enable) {
        info!(url = %influx.url, bucket = %influx.bucket, "InfluxDB sink enabled");
        sinks.push(Arc::new(InfluxSink::new(influx, config.site.timezone)?));
    }
    if let Some(archive) = &config.archive {
        sinks.push(Arc::new(archive::ArchiveSink::open(archive)?));
    }
    if sinks.is_empty() {
        warn!("no sinks configured, batches will only be logged");
    }
    Ok(sinks)
}

async fn run(config: SiteConfig) -> Result<()> {
    let plan = config.tier_plan()?;
    let devices = build_devices(&config)?;
    let sinks = build_sinks(&config)?;
    let cache = Arc::new(SiteCache::new(config.inverters.iter().map(|i| i.name.clone())));
    let solar: Arc<dyn SolarModel> = Arc::new(Astronomical::new(config.site.location));

    let poller = Arc::new(Poller::new(
        devices,
        cache.clone(),
        config.poll_timeout(),
        config.sampling.stale_after_failures,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        cache,
        sinks,
        solar.clone(),
        SiteContext::from(&config.site),
    ));
    let settings = SchedulerSettings {
        horizon_deg: config.site.horizon_deg,
        solar_check: config.solar_check(),
        shutdown_grace: config.shutdown_grace(),
        timezone: config.site.timezone,
    };

    info!(
        site = %config.site.name,
        inverters = config.inverters.len(),
        "starting pvsited"
    );
    let scheduler = TierScheduler::new(plan, poller, dispatcher, solar, settings);
    let report = scheduler
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            warn!("received ctrl-c, stopping");
        })
        .await;

    if report.aborted > 0 {
        warn!(aborted = report.aborted, "in-flight ticks were aborted");
    }
    Ok(())
}

fn print_plan(config: &SiteConfig) -> Result<()> {
    let plan = config.tier_plan()?;
    println!("=== {} ===", config.site.name);
    println!("Timezone:   {}", config.site.timezone);
    let location = &config.site.location;
    println!(
        "Location:   {:.4}, {:.4} ({} m)",
        location.latitude, location.longitude, location.elevation_m
    );
    println!("Horizon:    {:.1}°", config.site.horizon_deg);
    let inverters: Vec<&str> = config.inverters.iter().map(|i| i.name.as_str()).collect();
    println!("Inverters:  {}", inverters.join(", "));
    for (label, mode) in [("Day", Mode::Day), ("Night", Mode::Night)] {
        println!("{label} tiers:");
        for tier in plan.active(mode) {
            let marker = if tier.name == plan.polling_tier(mode) { " (polls)" } else { "" };
            println!("  {:<7} every {:>4}s{marker}", tier.name.as_str(), tier.period.as_secs());
            for output in &tier.outputs {
                println!("           {output}");
            }
        }
    }
    Ok(())
}

fn print_sun(config: &SiteConfig, format: OutputFormat) -> Result<()> {
    let now = Utc::now();
    let position = Astronomical::new(config.site.location).position(now);
    let daylight = is_daylight(position.elevation_deg, config.site.horizon_deg);
    let irradiance = config
        .site
        .panels
        .as_ref()
        .map(|panels| clearsky_irradiance(now, &config.site.location, panels));

    let out = json!({
        "ts": now,
        "azimuth_deg": position.azimuth_deg,
        "elevation_deg": position.elevation_deg,
        "daylight": daylight,
        "irradiance_w_m2": irradiance,
    });
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
        OutputFormat::Ndjson => println!("{}", serde_json::to_string(&out)?),
        OutputFormat::Human => {
            println!("Time:       {}", now.to_rfc3339());
            println!("Azimuth:    {:.1}°", position.azimuth_deg);
            println!("Elevation:  {:.1}°", position.elevation_deg);
            println!("Mode:       {}", if daylight { "day" } else { "night" });
            if let Some(irradiance) = irradiance {
                println!("Clear sky:  {irradiance:.1} W/m²");
            }
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &SiteSnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snapshot)?);
        }
        OutputFormat::Ndjson => {
            println!("{}", serde_json::to_string(snapshot)?);
        }
        OutputFormat::Human => {
            println!("=== Site Snapshot ===");
            println!(
                "Time:       {}",
                snapshot
                    .updated_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into())
            );
            println!("Status:     {} (generation {})", snapshot.status, snapshot.generation);
            if !snapshot.excluded.is_empty() {
                println!("Excluded:   {}", snapshot.excluded.join(", "));
            }
            println!("Totals:");
            for (key, total) in &snapshot.totals {
                println!(
                    "  {:<28} {:>12.1}  ({} devices)",
                    keys::topic_for_key(key),
                    total.value,
                    total.contributors
                );
            }
            println!("Devices:");
            for device in snapshot.devices.values() {
                let ac = device
                    .readings
                    .get(keys::AC_POWER)
                    .and_then(|r| r.total())
                    .map(|w| format!("{w:.0} W"))
                    .unwrap_or_else(|| "n/a".into());
                println!(
                    "  {:<12} {:?} status={} ac={}{}",
                    device.device,
                    device.freshness,
                    device.status,
                    ac,
                    device
                        .last_error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
