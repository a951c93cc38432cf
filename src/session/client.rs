//! top level entry point called by main to run a midi jam endpoint
//!
//! Pieces started by [`run`]:
//! - the websocket signaling thread, joined to the configured room
//! - a [`JamSession`] using UDP links, moved into its own high priority thread that
//!   ticks every millisecond
//! - a thread reading UI commands ([`ParamMessage`] json, one per line) from stdin
//!
//! The calling thread then prints every [`SessionEvent`] as one line of json on stdout
//! until stdin closes.
use crate::{
    clock::{clock_sync::SyncConfig, SystemClock},
    common::{box_error::BoxError, config::Config, role::Role},
    link::udp_link::UdpTransport,
    playback::scheduler::SchedulerConfig,
    session::{
        jam_session::{JamSession, SessionEvent, SessionSettings},
        param_message::ParamMessage,
        routing::FilterMode,
    },
    signal::websocket::start_room_signaling,
    utils,
};
use log::{debug, error, info, warn};
use std::{
    io::{self, BufRead, Write},
    net::IpAddr,
    sync::{mpsc, Arc},
    thread::{self, sleep},
    time::Duration,
};
use thread_priority::{ThreadBuilder, ThreadPriority};

const SESSION_TICK: Duration = Duration::from_millis(1);

/// command line overrides for values in the config file
#[derive(Debug, Default, Clone)]
pub struct ClientArgs {
    pub config_file: Option<String>,
    pub role: Option<Role>,
    pub peer_id: Option<String>,
    pub master_id: Option<String>,
    pub room: Option<String>,
    pub buffer_ms: Option<f64>,
}

/// everything [`run`] needs out of the config
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    pub room: String,
    pub bind_ip: IpAddr,
    pub advertise_ip: IpAddr,
    pub session: SessionSettings,
}

/// This is the entry point for a midi jam endpoint.  Returns when stdin closes.
pub fn run(args: ClientArgs) -> Result<(), BoxError> {
    info!("client::run - starting");
    let config = init_config(&args)?;
    debug!("client::run - config init complete");

    let (signaling, _ws_handle) = start_room_signaling(
        &config.session.local_id,
        &config.room,
        &config.ws_url,
        None,
    )?;
    debug!("client::run - signaling thread started");

    let (event_tx, event_rx) = mpsc::channel();
    let (command_tx, command_rx) = mpsc::channel();
    let session = JamSession::new(
        config.session,
        Arc::new(SystemClock),
        Box::new(signaling),
        Box::new(UdpTransport::new(config.bind_ip, config.advertise_ip)),
        event_tx,
    );
    let _session_handle = start_session_thread(session, command_rx)?;
    debug!("client::run - session thread started");

    let _stdin_handle = start_command_reader(command_tx)?;
    debug!("client::run - setup complete, beginning main event loop");
    run_main_loop(event_rx)
}

/// Build the session settings from the config file (default "settings.json") with the
/// command line overrides applied on top.
///
/// # Errors
/// Bad filename, or a value in the file that does not parse (role, filter mode, ip).
pub fn init_config(args: &ClientArgs) -> Result<ClientConfig, BoxError> {
    let default_params = json::object! {
        "ws_url": "ws://rtjam-nation.com/primus",
        "room": "midi-room",
        "peer_id": "",
        "role": "follower",
        "master_id": "",
        "buffer_ms": 150.0,
        "skew_ceiling_ms": 1000.0,
        "ping_interval_ms": 2000.0,
        "filter_mode": "solo",
        "relay_enabled": false,
        "bind_ip": "0.0.0.0",
        "advertise_ip": "127.0.0.1",
        "peer_timeout_ms": 10000.0
    };
    let filename = args.config_file.as_deref().unwrap_or("settings.json");
    info!("client::init_config - using config file: {}", filename);
    let mut config = Config::build(String::from(filename), default_params).map_err(|e| {
        error!("Issue with config file or parameter: {}", e);
        e
    })?;

    // command line wins
    if let Some(role) = args.role {
        config.set_value("role", role.to_string())?;
    }
    if let Some(id) = &args.peer_id {
        config.set_value("peer_id", id.as_str())?;
    }
    if let Some(id) = &args.master_id {
        config.set_value("master_id", id.as_str())?;
    }
    if let Some(room) = &args.room {
        config.set_value("room", room.as_str())?;
    }
    if let Some(ms) = args.buffer_ms {
        config.set_value("buffer_ms", ms)?;
    }
    config.dump();

    let mut local_id = config.get_str_value("peer_id", None)?;
    if local_id.is_empty() {
        local_id = utils::default_peer_id();
    }
    let role: Role = config.get_str_value("role", None)?.parse()?;
    let master_id = config.get_str_value("master_id", None)?;
    let skew_ceiling_ms = config.get_f64_value("skew_ceiling_ms", None)?;

    let mut session = SessionSettings::new(
        &local_id,
        role,
        if master_id.is_empty() { None } else { Some(master_id.as_str()) },
    );
    session.scheduler = SchedulerConfig {
        buffer_ms: 0.0,
        skew_ceiling_ms,
    }
    .with_buffer_ms(config.get_f64_value("buffer_ms", None)?)?;
    session.sync = SyncConfig {
        ping_interval_ms: config.get_f64_value("ping_interval_ms", None)?,
        skew_threshold_ms: skew_ceiling_ms,
        ..SyncConfig::default()
    };
    session.filter_mode = config.get_str_value("filter_mode", None)?.parse::<FilterMode>()?;
    session.relay_enabled = config.get_bool_value("relay_enabled", None)?;
    session.peer_timeout_ms = config.get_f64_value("peer_timeout_ms", None)?;

    let client = ClientConfig {
        ws_url: config.get_str_value("ws_url", None)?,
        room: config.get_str_value("room", None)?,
        bind_ip: config.get_str_value("bind_ip", None)?.parse()?,
        advertise_ip: config.get_str_value("advertise_ip", None)?.parse()?,
        session,
    };
    info!(
        "Config values: ws_url: {}, room: {}, id: {}, role: {}, master: {:?}",
        client.ws_url,
        client.room,
        client.session.local_id,
        client.session.role,
        client.session.master_id
    );
    Ok(client)
}

// tick the session until the command channel hangs up
fn session_loop(mut session: JamSession, command_rx: mpsc::Receiver<ParamMessage>) {
    loop {
        loop {
            match command_rx.try_recv() {
                Ok(msg) => session.process_param_command(msg),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    info!("client::session_loop - command channel closed, shutting down");
                    session.shutdown();
                    return;
                }
            }
        }
        session.process();
        sleep(SESSION_TICK);
    }
}

fn start_session_thread(
    session: JamSession,
    command_rx: mpsc::Receiver<ParamMessage>,
) -> Result<thread::JoinHandle<()>, BoxError> {
    let builder = ThreadBuilder::default()
        .name("session".to_string())
        .priority(ThreadPriority::Max);

    let handle = builder.spawn(move |result| {
        if let Err(e) = result {
            warn!("client::start_session_thread - running at normal priority: {:?}", e);
        }
        session_loop(session, command_rx);
    })?;
    Ok(handle)
}

// one ParamMessage per line.  The thread ends (and takes the session with it) at eof.
fn start_command_reader(
    command_tx: mpsc::Sender<ParamMessage>,
) -> Result<thread::JoinHandle<()>, BoxError> {
    let handle = thread::Builder::new()
        .name("commands".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        error!("client::start_command_reader - {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ParamMessage::from_string(&line) {
                    Ok(msg) => {
                        if command_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("client::start_command_reader - bad command {}: {}", line, e),
                }
            }
            info!("client::start_command_reader - stdin closed");
        })?;
    Ok(handle)
}

fn run_main_loop(event_rx: mpsc::Receiver<SessionEvent>) -> Result<(), BoxError> {
    let stdout = io::stdout();
    for event in event_rx {
        let mut out = stdout.lock();
        writeln!(out, "{}", event.as_json())?;
        out.flush()?;
    }
    info!("client::run_main_loop - session ended");
    Ok(())
}
