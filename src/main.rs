use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use zeroize::Zeroizing;

use luksrku::keydb::KeyDb;
use luksrku::{DEFAULT_PORT, client, editor, logging, server};

#[derive(Parser)]
#[command(
    name = "luksrku",
    version,
    about = "Remotely unlock LUKS full-disk-encrypted headless hosts over TLS-PSK"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Contact a key server and unlock local LUKS volumes
    Client {
        /// Give up after this period of time, in seconds, when not all
        /// volumes could be unlocked; 0 = never. Overrides the database
        /// default.
        #[arg(long, short = 't')]
        timeout: Option<u64>,
        /// Port used for both UDP discovery and TCP communication
        #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Do not call LUKS/cryptsetup; useful for testing the unlock
        /// procedure
        #[arg(long)]
        no_luks: bool,
        /// Increase verbosity (repeatable)
        #[arg(long, short = 'v', action = ArgAction::Count)]
        verbose: u8,
        /// Exported database file with the TLS-PSK and the list of disks
        filename: PathBuf,
        /// Disable auto-searching and only contact this key server
        hostname: Option<String>,
    },
    /// Serve LUKS passphrases to authenticated clients
    Server {
        /// Port used for both UDP discovery and TCP communication
        #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Log errors only
        #[arg(long, short = 's')]
        silent: bool,
        /// Increase verbosity (repeatable)
        #[arg(long, short = 'v', action = ArgAction::Count)]
        verbose: u8,
        /// Server database file holding PSKs and LUKS passphrases
        filename: PathBuf,
    },
    /// Edit a key database interactively
    Edit {
        /// Increase verbosity (repeatable)
        #[arg(long, short = 'v', action = ArgAction::Count)]
        verbose: u8,
        /// Database file to open on startup
        filename: Option<PathBuf>,
    },
}

fn load_database(filename: &PathBuf) -> Result<KeyDb> {
    let passphrase = Zeroizing::new(
        rpassword::prompt_password("Database passphrase: ")
            .context("Failed to read passphrase")?,
    );
    KeyDb::read(filename, &passphrase)
        .with_context(|| format!("Failed to load key database {}", filename.display()))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Client {
            timeout,
            port,
            no_luks,
            verbose,
            filename,
            hostname,
        } => {
            logging::init(verbose, false);
            let db = load_database(&filename)?;
            let keyclient = client::KeyClient::new(
                db,
                client::ClientOpts {
                    port,
                    timeout_secs: timeout,
                    no_luks,
                    hostname,
                },
            )?;
            runtime()?.block_on(keyclient.run())
        }
        Commands::Server {
            port,
            silent,
            verbose,
            filename,
        } => {
            logging::init(verbose, silent);
            let db = load_database(&filename)?;
            runtime()?.block_on(server::serve(db, port))
        }
        Commands::Edit { verbose, filename } => {
            logging::init(verbose, false);
            editor::run(editor::EditorOpts { filename })
        }
    }
}
