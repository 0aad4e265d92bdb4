use clap::Parser;
use netline::codec::{NetstringCodec, NewlineCodec, ProtocolKind};
use netline::{init_tracing, Error, Protocol, Request, Server};
use tokio::task::LocalSet;
use tracing::{debug, warn};

const PORT: u16 = 8888;

/// Echo server: every request is answered with its own body.
#[derive(Parser, Debug)]
struct Args {
    /// The address to listen on
    #[arg(long, env = "NETLINE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// The port to listen on
    #[arg(short, long, env = "NETLINE_PORT", default_value_t = PORT)]
    port: u16,

    /// Wire format: newline or netstring
    #[arg(long, env = "NETLINE_PROTOCOL", default_value_t = ProtocolKind::Netstring)]
    protocol: ProtocolKind,

    /// Close connections after each response instead of keeping them alive
    #[arg(long)]
    close: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn echo<P: Protocol>(mut request: Request<P>) {
    debug!(%request, "echo");

    let body = request.body().clone();
    if let Err(e) = request.write(body) {
        warn!(error = %e, "failed to answer request");
    }
}

async fn serve<P: Protocol>(args: Args) -> Result<(), Error> {
    let mut server = Server::<P>::new(echo).keep_alive(!args.close);
    server.listen((args.host.as_str(), args.port)).await?;

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    LocalSet::new()
        .run_until(async move {
            match args.protocol {
                ProtocolKind::Newline => serve::<NewlineCodec>(args).await,
                ProtocolKind::Netstring => serve::<NetstringCodec>(args).await,
            }
        })
        .await
}
