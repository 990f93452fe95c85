//! Command-line entry points for a Tuya plug: one-shot `on`/`off`/`status`
//! and a long-running `run` mode that reads unit commands from stdin.

use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tuya_plug::config::{parse_groups, parse_index_list, parse_metering};
use tuya_plug::error::{Result, TuyaError, get_error_message};
use tuya_plug::{
    Command, DeviceModel, DeviceSession, Dps, DpsIndex, MeterReading, PlugConfig, PlugController,
    PlugSet, Version,
};

/// Local control of a Tuya smart plug
#[derive(Parser)]
#[command(name = "tuya-plug")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (replaces the device flags)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device IP address
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Device id
    #[arg(short, long, global = true)]
    id: Option<String>,

    /// 16 character local key; 3.1 devices can report status without it
    #[arg(short, long, global = true, default_value = "")]
    key: String,

    /// Protocol version (3.1 or 3.3)
    #[arg(long, global = true, default_value = "3.3")]
    protocol: Version,

    /// TCP port
    #[arg(short = 'P', long, global = true, default_value = "6668")]
    port: u16,

    /// Switch dps, e.g. "1;2;3"
    #[arg(long, global = true, default_value = "1")]
    dps: String,

    /// Groups, e.g. "1;2:3;4", or "None"
    #[arg(long, global = true, default_value = "None")]
    groups: String,

    /// Current, power and voltage dps, e.g. "18;19;20", or "None"
    #[arg(long, global = true, default_value = "None")]
    metering: String,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Switch a unit on and print the resulting status
    On {
        #[arg(default_value = "1")]
        unit: u32,
    },
    /// Switch a unit off and print the resulting status
    Off {
        #[arg(default_value = "1")]
        unit: u32,
    },
    /// Print the device's dps and the list of boolean dps
    Status,
    /// Keep the device under control; reads "UNIT On|Off|Set Level N" lines
    /// from stdin
    Run,
}

impl Cli {
    fn plug_config(&self) -> Result<PlugConfig> {
        if let Some(path) = &self.config {
            let json = std::fs::read_to_string(path)
                .map_err(|e| TuyaError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            return PlugConfig::from_json(&json);
        }
        let missing = |what: &str| TuyaError::InvalidConfig(format!("--{} is required", what));
        let address = self.address.as_deref().ok_or_else(|| missing("address"))?;
        let id = self.id.as_deref().ok_or_else(|| missing("id"))?;
        let config = PlugConfig::new(address, id, self.key.as_str())
            .with_version(self.protocol)
            .with_port(self.port)
            .with_dps(parse_index_list(&self.dps)?)
            .with_groups(parse_groups(&self.groups)?)
            .with_metering(parse_metering(&self.metering)?);
        config.validate()?;
        Ok(config)
    }
}

/// Device model that logs what the device reports.
struct LogModel;

impl DeviceModel for LogModel {
    fn update_switch(&mut self, index: DpsIndex, is_on: bool) {
        info!("Switch {} is {}", index, if is_on { "On" } else { "Off" });
    }

    fn update_meter(&mut self, reading: &MeterReading) {
        info!(
            "Meter: {:?} A, {:?} W, {:?} V",
            reading.current, reading.power, reading.voltage
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let result = match cli.plug_config() {
        Ok(config) => match cli.command {
            Commands::On { unit } => switch(config, unit, Command::On).await,
            Commands::Off { unit } => switch(config, unit, Command::Off).await,
            Commands::Status => status(config).await,
            Commands::Run => run(config).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} ({})", e, get_error_message(e.code()));
            ExitCode::FAILURE
        }
    }
}

async fn switch(config: PlugConfig, unit: u32, command: Command) -> Result<()> {
    if !config.has_key() {
        return Err(TuyaError::InvalidConfig("switching needs --key".into()));
    }
    let mut plugs = PlugSet::from_config(&config);
    plugs.apply(unit, command)?;
    let wait = config.connect_timeout();
    let mut session = DeviceSession::new(&config)?;
    session.open_link().await?;

    let seqno = session.send_set(&plugs.merged_payload()).await?;
    timeout(wait, session.reply_to(seqno))
        .await
        .map_err(|_| TuyaError::Timeout)??;
    print_status(&mut session, &config).await
}

async fn status(config: PlugConfig) -> Result<()> {
    let mut session = DeviceSession::new(&config)?;
    session.open_link().await?;
    print_status(&mut session, &config).await
}

async fn print_status(session: &mut DeviceSession, config: &PlugConfig) -> Result<()> {
    let seqno = session.send_status().await?;
    let dps = timeout(config.connect_timeout(), session.reply_to(seqno))
        .await
        .map_err(|_| TuyaError::Timeout)??
        .ok_or(TuyaError::InvalidPayload)?;
    println!("{}", serde_json::to_string(&dps)?);
    println!("{}", boolean_dps(&dps));
    session.disconnect();
    Ok(())
}

/// `"1;2;7"`: indices whose value is a boolean.
fn boolean_dps(dps: &Dps) -> String {
    dps.iter()
        .filter(|(_, value)| value.is_boolean())
        .map(|(index, _)| index.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

async fn run(config: PlugConfig) -> Result<()> {
    let handle = PlugController::new(config, LogModel)?.spawn();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some((unit, command, level)) => {
                if let Err(e) = handle.command(unit, command, level).await {
                    error!("{}: {}", line, e);
                }
            }
            None => error!("Expected \"UNIT On|Off|Set Level N\", got \"{}\"", line),
        }
    }

    handle.stop().await;
    Ok(())
}

/// Splits `"9 Set Level 10"` into unit, command and level.
fn parse_line(line: &str) -> Option<(u32, &str, u8)> {
    let (unit, rest) = line.split_once(char::is_whitespace)?;
    let unit = unit.parse().ok()?;
    let rest = rest.trim();
    match rest.rsplit_once(char::is_whitespace) {
        Some((command, level)) if command.trim() == "Set Level" => {
            Some((unit, "Set Level", level.parse().ok()?))
        }
        _ => Some((unit, rest, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stdin_lines() {
        assert_eq!(parse_line("1 On"), Some((1, "On", 0)));
        assert_eq!(parse_line("9  Off"), Some((9, "Off", 0)));
        assert_eq!(parse_line("2 Set Level 10"), Some((2, "Set Level", 10)));
        assert_eq!(parse_line("2 Set Level x"), None);
        assert_eq!(parse_line("On"), None);
    }

    #[test]
    fn status_without_key_on_v31() {
        let cli = Cli::parse_from([
            "tuya-plug", "-a", "10.0.0.2", "-i", "dev", "--protocol", "3.1", "status",
        ]);
        let config = cli.plug_config().unwrap();
        assert_eq!(config.version, Version::V3_1);
        assert!(!config.has_key());

        let cli = Cli::parse_from(["tuya-plug", "-a", "10.0.0.2", "-i", "dev", "status"]);
        assert!(matches!(cli.plug_config(), Err(TuyaError::InvalidConfig(_))));
    }

    #[test]
    fn lists_boolean_dps() {
        let mut dps = Dps::new();
        dps.insert(DpsIndex(1), json!(true));
        dps.insert(DpsIndex(2), json!(false));
        dps.insert(DpsIndex(18), json!(120));
        assert_eq!(boolean_dps(&dps), "1;2");
    }
}
