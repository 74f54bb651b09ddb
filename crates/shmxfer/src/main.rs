use std::{path::Path, process::exit};

use clap::Parser;
use mimalloc::MiMalloc;
use shmxfer_common::{
    error::Result,
    key::ChannelKey,
    lifecycle::{
        Channels, Role, install_interrupt_handler, yield_to_interrupt,
    },
    protocol_common::CHUNK_CAPACITY,
    transfer::{
        ReceiverSession, SenderSession, announced_name, destination_path,
        open_destination, open_source,
    },
};
use snafu::Report;
use tracing::{error, info};

pub mod cli;
pub mod tracing_init;

use crate::{
    cli::{Args, Common},
    tracing_init::init_tracing,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing(&args) {
        eprintln!("unable to initialize logging: {e}");
        exit(1);
    }

    let res = match &args {
        Args::Send { file, common } => run_sender(file, common),
        Args::Recv { output_dir, common } => run_receiver(output_dir, common),
    };

    if let Err(e) = res {
        yield_to_interrupt();
        error!("{} failed: {e}", args.role_name());
        eprintln!("{}", Report::from_error(e));
        exit(1);
    }
}

fn run_sender(file: &Path, common: &Common) -> Result<()> {
    // both checks happen before the peer can see anything
    let name = announced_name(file)?;
    let source = open_source(file)?;

    install_interrupt_handler()?;
    let key = ChannelKey::from_marker(&common.key_file)?;
    let mut chans = Channels::open(key, CHUNK_CAPACITY, Role::Sender)?;

    let sent = {
        let (buffer, control) = chans.split_mut();
        let mut session = SenderSession::new(buffer, control);
        session.send_name(&name)?;
        let sent = session.stream(source)?;
        info!("sent {sent} bytes in {} chunks", session.chunks());
        sent
    };
    chans.finish()?;

    eprintln!("The number of bytes sent is {sent}");
    Ok(())
}

fn run_receiver(output_dir: &Path, common: &Common) -> Result<()> {
    install_interrupt_handler()?;
    let key = ChannelKey::from_marker(&common.key_file)?;
    let chans = Channels::open(key, CHUNK_CAPACITY, Role::Receiver)?;

    let received = {
        let mut session = ReceiverSession::new(chans.buffer(), chans.control());
        let name = session.receive_name()?;
        let dest_path = destination_path(output_dir, &name)?;
        let dest = open_destination(&dest_path)?;
        info!("writing to {}", dest_path.display());
        session.stream(dest)?
    };
    chans.finish()?;

    eprintln!("The number of bytes received is: {received}");
    Ok(())
}
