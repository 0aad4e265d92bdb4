use clap::Parser;
use netline::codec::{NetstringCodec, NewlineCodec, ProtocolKind};
use netline::{init_tracing, Client, Error, Protocol};

const PORT: u16 = 8888;

/// Sends each payload as one request and prints the responses.
#[derive(Parser, Debug)]
struct Args {
    /// The server address
    #[arg(long, env = "NETLINE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// The server port
    #[arg(short, long, env = "NETLINE_PORT", default_value_t = PORT)]
    port: u16,

    /// Wire format: newline or netstring
    #[arg(long, env = "NETLINE_PROTOCOL", default_value_t = ProtocolKind::Netstring)]
    protocol: ProtocolKind,

    /// Payloads to send, one request each
    #[arg(required = true)]
    payloads: Vec<String>,
}

async fn call_all<P: Protocol>(args: Args) -> Result<(), Error> {
    let mut client = Client::<_, P>::connect((args.host.as_str(), args.port)).await?;

    for payload in args.payloads {
        let response = client.call(payload).await?;
        println!("{}", String::from_utf8_lossy(&response));
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_tracing("warn");

    match args.protocol {
        ProtocolKind::Newline => call_all::<NewlineCodec>(args).await,
        ProtocolKind::Netstring => call_all::<NetstringCodec>(args).await,
    }
}
