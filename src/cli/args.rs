//! CLI argument definitions using clap derive

use crate::manifest::{ArtifactKind, ManifestTrust};
use crate::volume::Volume;
use crate::error::BootcacheResult;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

/// bootcache - boot-time kernel cache maintenance
///
/// Keeps per-volume boot caches (module archives and prelinked kernels)
/// in step with their sources, and coordinates rebuilders through an
/// advisory per-volume lock.
#[derive(Parser, Debug)]
#[command(name = "bootcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BOOTCACHE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report which cached paths and artifacts of a volume are stale
    Check(CheckArgs),

    /// Rebuild out-of-date artifacts and commit fresh stamps
    Update(UpdateArgs),

    /// Build one artifact explicitly
    Build(BuildArgs),

    /// List the slices of a container file
    Inspect(InspectArgs),

    /// Run the lock coordinator
    Daemon(DaemonArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Volume selection shared by `check` and `update`
#[derive(Args, Debug, Clone)]
pub struct VolumeArgs {
    /// Volume mount point
    pub root: PathBuf,

    /// Volume UUID (derived from the device when omitted)
    #[arg(long)]
    pub uuid: Option<Uuid>,

    /// Volume label (defaults to the mount point's name)
    #[arg(long)]
    pub label: Option<String>,

    /// Trust manifests and modules owned by this uid instead of root
    #[arg(long, value_name = "UID")]
    pub owner: Option<u32>,
}

impl VolumeArgs {
    pub fn probe(&self) -> BootcacheResult<Volume> {
        Ok(Volume::probe(&self.root)?.with_identity(self.uuid, self.label.clone()))
    }

    pub fn trust(&self) -> ManifestTrust {
        match self.owner {
            Some(owner_uid) => ManifestTrust { owner_uid },
            None => ManifestTrust::default(),
        }
    }
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,
}

/// Arguments for the update command
#[derive(Parser, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub volume: VolumeArgs,

    /// Rebuild and restamp even if everything looks current
    #[arg(short, long)]
    pub force: bool,
}

/// Artifact kinds accepted by `build`
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    Mkext,
    Kernelcache,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Mkext => ArtifactKind::Mkext,
            KindArg::Kernelcache => ArtifactKind::KernelCache,
        }
    }
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Artifact kind
    #[arg(short, long, value_enum)]
    pub kind: KindArg,

    /// Artifact path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Kernel image (kernel caches only)
    #[arg(long, required_if_eq("kind", "kernelcache"))]
    pub kernel: Option<PathBuf>,

    /// Module directory (repeatable)
    #[arg(short, long = "modules", required = true)]
    pub modules: Vec<PathBuf>,

    /// Architecture to include (repeatable; defaults from config)
    #[arg(short, long = "arch")]
    pub archs: Vec<String>,

    /// Only include modules required for this boot phase (repeatable)
    #[arg(long = "required")]
    pub required: Vec<String>,

    /// Suffix the output name with a digest of this variant string
    #[arg(long)]
    pub variant: Option<String>,

    /// Trust modules owned by this uid instead of root
    #[arg(long, value_name = "UID")]
    pub owner: Option<u32>,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Container file
    pub file: PathBuf,

    /// Show the slice that best serves this architecture
    #[arg(short, long)]
    pub arch: Option<String>,
}

/// Arguments for the daemon command
#[derive(Parser, Debug)]
pub struct DaemonArgs {
    /// Socket path (overrides lock.socket_path)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Additional volume roots to watch (repeatable)
    #[arg(short, long)]
    pub watch: Vec<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}
