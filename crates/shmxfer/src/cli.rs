use std::path::PathBuf;

use shmxfer_common::protocol_common::DEFAULT_KEY_FILE;

static HELP_STR_KEY_FILE: &str = "
    Marker file both sides derive the channel key from. Whichever side \
                                  starts first creates it. Sender and \
                                  receiver must point at the same file or \
                                  they will never meet. Example value: \
                                  \"keyfile.txt\"
";

#[derive(clap::Args, Debug, Clone)]
pub struct Common {
    #[arg(
        long,
        short,
        value_name = "KEY_FILE",
        help = HELP_STR_KEY_FILE,
        default_value = DEFAULT_KEY_FILE
    )]
    pub key_file: PathBuf,

    #[arg(
        long,
        short = 'l',
        value_name = "LOG_PATH",
        help = "Optional log path value. If not provided, logs will be \
                placed in /tmp/shmxfer-$ROLE-$PID.log"
    )]
    pub log_path: Option<PathBuf>,

    #[arg(
        long,
        help = "Log to stderr instead of a file",
        conflicts_with = "log_path"
    )]
    pub stderr_log: bool,
}

#[derive(clap::Parser, Debug)]
#[command(
    name = "shmxfer",
    version,
    about = "shmxfer",
    long_about = "Moves one file from a sending process to a receiving \
                  process on the same host, one shared memory chunk at a \
                  time, with a message queue carrying the handshake"
)]
pub enum Args {
    /// Send a file
    Send {
        #[arg(value_name = "FILE", help = "Path of the file to transfer")]
        file: PathBuf,

        #[command(flatten)]
        common: Common,
    },
    /// Receive a file
    Recv {
        #[arg(
            long,
            short,
            value_name = "OUTPUT_DIR",
            help = "Directory the received file is written to",
            default_value = "."
        )]
        output_dir: PathBuf,

        #[command(flatten)]
        common: Common,
    },
}

impl Args {
    pub fn common(&self) -> &Common {
        match self {
            Args::Send { common, .. } | Args::Recv { common, .. } => common,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Args::Send { .. } => "sender",
            Args::Recv { .. } => "receiver",
        }
    }
}
