use std::{
    error::Error,
    io::{self, BufRead, Write},
    net::{SocketAddr, UdpSocket},
    path::PathBuf,
    sync::Arc,
};

use clap::{Parser, Subcommand};
use gaian_lite::{
    Command, CommandError,
    config::{ClientConfig, LiteConfig},
    discovery::{
        ConnectionOpener, ConnectionTarget, CredentialScrambler, Credentials, Discoverer,
    },
    prompt,
    protocol::{LiteConnection, MessagePool, QuerySession, SessionError},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the client configuration file
    #[arg(long, default_value = "gaian-lite.toml")]
    config: PathBuf,
    /// User to connect as, instead of the one a node offers
    #[arg(long, global = true)]
    user: Option<String>,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Find a node on the local network and print where it is
    Discover,
    /// Run statements against a node over the lite protocol
    Query {
        /// Address of the node's lite listener
        #[arg(long, required_unless_present = "discover", conflicts_with = "discover")]
        server: Option<SocketAddr>,
        /// Discover the node instead of naming it
        #[arg(long)]
        discover: bool,
    },
}

/// Lite connections do not authenticate, so the offered password is kept as is.
struct Offered;

impl CredentialScrambler for Offered {
    fn unscramble(&self, scrambled: &str, _node_id: &str) -> String {
        scrambled.to_string()
    }
}

struct LiteOpener<'a> {
    pool: Arc<MessagePool>,
    lite: &'a LiteConfig,
}

impl LiteOpener<'_> {
    fn connect(&self, server: SocketAddr) -> Result<LiteConnection, SessionError> {
        LiteConnection::connect(
            server,
            Arc::clone(&self.pool),
            self.lite.datagram_size,
            self.lite.timeout(),
        )
    }
}

impl ConnectionOpener for LiteOpener<'_> {
    type Connection = LiteConnection;
    type Error = SessionError;

    fn open(&self, target: &ConnectionTarget) -> Result<LiteConnection, SessionError> {
        self.connect(target.endpoint())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig::load_or_default(&cli.config)?;
    let credentials = Credentials {
        user: cli.user,
        password: None,
    };
    let discoverer = Discoverer::new(config.discovery.clone());

    match cli.mode {
        Mode::Discover => {
            let node = discoverer.discover(credentials.user.as_deref())?;
            let target = ConnectionTarget::derive(
                &node,
                config.discovery.connection_strategy,
                &credentials,
                &Offered,
            )?;
            println!("node {} at {target} (user {})", node.node_id, target.user);
        }
        Mode::Query { server, discover } => {
            let opener = LiteOpener {
                pool: Arc::new(MessagePool::new(config.lite.pool_capacity)),
                lite: &config.lite,
            };
            let mut conn = match server {
                Some(addr) if !discover => opener.connect(addr)?,
                _ => discoverer.connect(&credentials, &Offered, &opener)?.1,
            };
            println!("connected to {}", conn.server());

            let mut stdin = io::stdin().lock();
            let mut stdout = io::stdout().lock();
            repl(&mut conn, &mut stdin, &mut stdout)?;
        }
    }

    Ok(())
}

fn repl<R: BufRead, W: Write>(
    conn: &mut LiteConnection,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<()> {
    let mut pending = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match prompt(&mut *reader, &mut *writer) {
                Ok(cmd) => cmd,
                Err(CommandError::EndOfInput) => break,
                Err(CommandError::Empty) => continue,
                Err(e) => {
                    eprintln!("error: {e}");
                    continue;
                }
            },
        };

        match cmd {
            Command::Exit => break,
            Command::Statement(sql) => {
                if let Err(e) = run_statement(conn, &sql, writer) {
                    eprintln!("query error: {e}");
                }
            }
            Command::Prepare(sql) => pending = run_prepared(conn, &sql, reader, writer)?,
            Command::Execute(_) => eprintln!("error: nothing prepared, use .prepare first"),
        }
    }
    Ok(())
}

fn run_statement<W: Write>(
    conn: &mut LiteConnection,
    sql: &str,
    writer: &mut W,
) -> Result<(), Box<dyn Error>> {
    let mut session = conn.query(sql)?;
    print_rows(&mut session, writer)?;
    session.close()?;
    Ok(())
}

/// Keeps one prepared statement open while the user executes it. Returns
/// the first command that is not an `.execute`.
fn run_prepared<R: BufRead, W: Write>(
    conn: &mut LiteConnection,
    sql: &str,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Option<Command>> {
    let mut session = match conn.prepare(sql) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("prepare error: {e}");
            return Ok(None);
        }
    };
    writeln!(
        writer,
        "prepared {} with {} parameter(s)",
        session.query_id(),
        session.parameter_count()
    )?;

    loop {
        let params = match prompt(&mut *reader, &mut *writer) {
            Ok(Command::Execute(params)) => params,
            Ok(other) => {
                if let Err(e) = session.close() {
                    eprintln!("close error: {e}");
                }
                return Ok(Some(other));
            }
            Err(CommandError::EndOfInput) => return Ok(Some(Command::Exit)),
            Err(CommandError::Empty) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        let result = session
            .execute(&params)
            .map_err(Box::<dyn Error>::from)
            .and_then(|()| print_rows(&mut session, writer));
        if let Err(e) = result {
            eprintln!("execute error: {e}");
        }
    }
}

fn print_rows<W: Write>(
    session: &mut QuerySession<'_, UdpSocket>,
    writer: &mut W,
) -> Result<(), Box<dyn Error>> {
    let header: Vec<&str> = session.columns().iter().map(|c| c.name.as_str()).collect();
    writeln!(writer, "{}", header.join(" | "))?;

    let mut count = 0;
    while let Some(row) = session.next_row()? {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        writeln!(writer, "{}", cells.join(" | "))?;
        count += 1;
    }
    writeln!(writer, "({count} row(s))")?;
    Ok(())
}
