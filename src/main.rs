use clap::{Parser, Subcommand};

// Import handler modules
mod handlers;

#[derive(Parser)]
#[command(name = "tii")]
#[command(about = "Terminal tunnel - drive a program on a remote pty over one TCP connection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a server and attach this terminal to its program
    #[command(aliases = &["c"])]
    Connect {
        /// Server address as host:port (defaults to $TIIADDR, then localhost:7115)
        #[arg(short, long)]
        addr: Option<String>,

        /// Upper bound in seconds for the retry delay; delays double from 1s
        #[arg(long, default_value = "4")]
        retry_cap: u64,
    },

    /// Wait for one client and run a program on a pty for it
    #[command(aliases = &["s"])]
    Serve {
        /// Address to listen on as host:port; an empty or '*' host listens everywhere
        #[arg(short, long)]
        addr: Option<String>,

        /// Program to run, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn main() {
    tii::logging::init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Connect { addr, retry_cap } => handlers::handle_connect(addr, retry_cap),
        Commands::Serve { addr, command } => handlers::handle_serve(addr, &command),
    };

    std::process::exit(code);
}
