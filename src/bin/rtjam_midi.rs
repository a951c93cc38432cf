use clap::Parser;
use rtjam_midi::{
    common::{box_error::BoxError, role::Role},
    session::client::{self, ClientArgs},
};

/// Low latency midi jamming over peer to peer links
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// settings file
    #[arg(short, long, default_value = "settings.json")]
    config: String,
    /// master or follower
    #[arg(short, long)]
    role: Option<Role>,
    /// endpoint id to use in the room (defaults to one made from the mac address)
    #[arg(short, long)]
    peer_id: Option<String>,
    /// endpoint id of the session master
    #[arg(short, long)]
    master_id: Option<String>,
    /// signaling room to join
    #[arg(long)]
    room: Option<String>,
    /// jitter buffer in msec
    #[arg(short, long)]
    buffer_ms: Option<f64>,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();
    client::run(ClientArgs {
        config_file: Some(args.config),
        role: args.role,
        peer_id: args.peer_id,
        master_id: args.master_id,
        room: args.room,
        buffer_ms: args.buffer_ms,
    })
}
