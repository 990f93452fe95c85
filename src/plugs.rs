//! Host-facing units (switches, groups, meter channels) mapped onto the
//! device's plugs.

use crate::config::PlugConfig;
use crate::error::{Result, TuyaError};
use crate::payload::{Dps, DpsIndex, MeterConfig, MeterReading, switch_state};
use crate::reconcile::{Command, Plug};
use log::{debug, info};
use std::collections::BTreeMap;

const SET_LEVEL: &str = "Set Level";
const LEVEL_OFF: u8 = 0;
const LEVEL_ON: u8 = 10;

/// Units reserved after the highest switch index before group ids start.
const GROUP_OFFSET: u32 = 5;

/// The host's device model. Called with observed values; redundant calls
/// with an unchanged value are harmless. An always-on plug seen off is not
/// reported, it is switched back on instead.
pub trait DeviceModel {
    fn update_switch(&mut self, index: DpsIndex, is_on: bool);

    fn update_meter(&mut self, _reading: &MeterReading) {}
}

impl Command {
    /// Translates a host command string. `Set Level` accepts the two
    /// levels a switch understands: 0 (off) and 10 (on).
    pub fn parse(command: &str, level: u8) -> Result<Command> {
        match command {
            SET_LEVEL => match level {
                LEVEL_OFF => Ok(Command::Off),
                LEVEL_ON => Ok(Command::On),
                other => Err(TuyaError::InvalidCommand(format!("{} {}", SET_LEVEL, other))),
            },
            other => other.parse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterChannel {
    Current,
    Energy,
    Voltage,
    Power,
}

/// What a host unit id addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Switch(DpsIndex),
    Group(Vec<DpsIndex>),
    Meter(MeterChannel),
}

#[derive(Debug)]
pub struct PlugSet {
    plugs: BTreeMap<DpsIndex, Plug>,
    units: BTreeMap<u32, Unit>,
    meter: Option<MeterConfig>,
}

impl PlugSet {
    /// Lays out units: one per switch at its dps index, then (with
    /// metering) four meter channels, then groups.
    pub fn from_config(config: &PlugConfig) -> Self {
        let indices = config.switch_indices();
        let highest = indices.last().map_or(0, |i| i.0);

        let mut plugs = BTreeMap::new();
        let mut units = BTreeMap::new();
        for index in indices {
            let mut plug = Plug::new(index);
            if config.always_on.contains(&index) {
                plug.set_always_on();
            }
            plugs.insert(index, plug);
            units.insert(index.0, Unit::Switch(index));
        }

        if config.metering.is_some() {
            let channels = [
                MeterChannel::Current,
                MeterChannel::Energy,
                MeterChannel::Voltage,
                MeterChannel::Power,
            ];
            for (offset, channel) in (1..).zip(channels) {
                units.insert(highest + offset, Unit::Meter(channel));
            }
        }

        for (offset, group) in (0..).zip(&config.groups) {
            units.insert(highest + GROUP_OFFSET + offset, Unit::Group(group.clone()));
        }

        Self {
            plugs,
            units,
            meter: config.metering,
        }
    }

    pub fn units(&self) -> impl Iterator<Item = (u32, &Unit)> {
        self.units.iter().map(|(id, unit)| (*id, unit))
    }

    pub fn unit(&self, id: u32) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn plug(&self, index: DpsIndex) -> Option<&Plug> {
        self.plugs.get(&index)
    }

    /// Records `command` on the plugs behind `unit`. Nothing is sent here.
    pub fn apply(&mut self, unit: u32, command: Command) -> Result<()> {
        let targets = match self.units.get(&unit) {
            Some(Unit::Switch(index)) => vec![*index],
            Some(Unit::Group(members)) => members.clone(),
            Some(Unit::Meter(channel)) => {
                return Err(TuyaError::InvalidCommand(format!(
                    "{} on {:?} meter unit",
                    command, channel
                )));
            }
            None => return Err(TuyaError::UnknownUnit(unit)),
        };
        for index in targets {
            if let Some(plug) = self.plugs.get_mut(&index) {
                plug.set_command(command);
                debug!("Plug {} pending {:?}", index, plug.pending());
            }
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.plugs.values().any(|plug| plug.pending().is_some())
    }

    /// One `set` payload carrying every pending command.
    pub fn merged_payload(&self) -> BTreeMap<DpsIndex, bool> {
        let mut payload = BTreeMap::new();
        for plug in self.plugs.values() {
            plug.put_payload(&mut payload);
        }
        payload
    }

    /// Applies an observed `dps` map: reports every known switch value to
    /// the model and settles pending commands.
    ///
    /// Returns `true` when some plug disagrees with its pending command and
    /// the request must be sent again.
    pub fn reconcile<M: DeviceModel>(&mut self, dps: &Dps, model: &mut M) -> bool {
        let mut retry = false;
        for (index, plug) in self.plugs.iter_mut() {
            let Some(is_on) = dps.get(index).and_then(switch_state) else {
                continue;
            };
            if is_on || !plug.is_always_on() {
                model.update_switch(*index, is_on);
            }
            if plug.update_state(is_on) {
                info!(
                    "Plug {} reported {}, still wants {:?}",
                    index,
                    if is_on { "on" } else { "off" },
                    plug.pending()
                );
                retry = true;
            }
        }
        self.observe_meter(dps, model);
        retry
    }

    /// Forwards metering values present in `dps`, if metering is configured.
    pub fn observe_meter<M: DeviceModel>(&self, dps: &Dps, model: &mut M) {
        let Some(config) = &self.meter else {
            return;
        };
        let reading = MeterReading::from_dps(dps, config);
        if !reading.is_empty() {
            model.update_meter(&reading);
        }
    }
}
