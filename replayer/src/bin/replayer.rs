use std::io::{self, Error, ErrorKind, Write};
use std::path::PathBuf;
use std::{fs, process};

use structopt::StructOpt;

use hvkd::machine::MachineImage;
use hvkd_commands::{Session, SessionConfig};

use replayer::Request;

use log::{error, info};

#[derive(StructOpt)]
#[structopt(name = "replayer")]
struct Opt {
    /// JSON array of requests.
    script: PathBuf,

    #[structopt(short, long)]
    machine: PathBuf,

    #[structopt(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let code = match run() {
        Ok(()) => exitcode::OK,
        Err(e) => {
            error!("{}", e);
            match e.kind() {
                ErrorKind::InvalidData => exitcode::DATAERR,
                _ => exitcode::IOERR,
            }
        }
    };
    process::exit(code);
}

fn run() -> Result<(), Error> {
    let opt = Opt::from_args();

    let config = match &opt.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let image = fs::read_to_string(opt.machine.as_path())?;
    let machine = MachineImage::from_json(&image[..])?.build()?;
    let session = Session::new(machine, config);

    let script = fs::read_to_string(opt.script.as_path())?;
    let requests: Vec<Request> = serde_json::from_str(&script[..])?;
    info!("replaying {} requests", requests.len());

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for request in requests.iter() {
        let response = replayer::execute(&session, request)?;
        serde_json::to_writer(&mut out, &response)?;
        writeln!(out)?;
    }
    Ok(())
}
