//! Shared runtime configuration.
//!
//! The [`Config`] struct is adorned with [`clap`] attributes so farm and
//! villein binaries can flatten it into their CLI. Both sides share it: the
//! codec selection applies to every peer on a transport, while the capacity
//! and secret only matter to farms.
use clap::{Args, ValueEnum};

const DEFAULT_VM_CAPACITY: usize = 8;
const HELP_HEADING: &str = "Demesne options";

/// Represents the main configuration structure for farms and villeins.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Maximum number of concurrently live VMs a farm will host.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_VM_CAPACITY)]
    pub vm_capacity: usize,

    /// Shared secret a farm checks on job submission. Submissions carrying a
    /// different secret are refused; submissions carrying none are admitted.
    #[arg(long, help_heading = HELP_HEADING, env = "FARM_SECRET")]
    pub farm_secret: Option<String>,

    /// Determines the wire codec to be used.
    #[arg(long, help_heading = HELP_HEADING, value_enum, default_value_t = Codec::Postcard)]
    pub codec: Codec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vm_capacity: DEFAULT_VM_CAPACITY,
            farm_secret: None,
            codec: Default::default(),
        }
    }
}

/// Enumerates the available wire codecs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Codec {
    #[default]
    Postcard,
    Cbor,
}
