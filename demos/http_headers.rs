use anyhow::{bail, Context};
use clap::Parser;
use log::debug;
use tinyloop::open_connection;

#[derive(Parser, Debug)]
#[command(version, about = "Print the HTTP headers of a URL", long_about = None)]
struct Args {
    /// The URL to query (http:// or https://).
    #[arg(default_value = "https://www.rust-lang.org")]
    url: String,
}

struct Target {
    host: String,
    port: u16,
    path: String,
    secure: bool,
}

fn parse_url(url: &str) -> anyhow::Result<Target> {
    let (secure, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        bail!("unsupported URL scheme in {url}");
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, "/"),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().context("invalid port")?),
        None => (authority, if secure { 443 } else { 80 }),
    };

    if host.is_empty() {
        bail!("no host in {url}");
    }

    Ok(Target {
        host: host.to_owned(),
        port,
        path: path.to_owned(),
        secure,
    })
}

async fn print_http_headers(target: Target) -> anyhow::Result<()> {
    let (mut reader, writer) = open_connection(&target.host, target.port, target.secure).await?;

    debug!("connected to {}:{}", target.host, target.port);

    let query = format!(
        "HEAD {} HTTP/1.0\r\nHost: {}\r\n\r\n",
        target.path, target.host
    );
    writer.write(query.as_bytes())?;

    loop {
        let line = reader.readline().await?;

        if line.is_empty() {
            break;
        }

        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end();

        if !line.is_empty() {
            println!("HTTP header> {line}");
        }
    }

    writer.close();

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let target = parse_url(&args.url)?;

    tinyloop::run(print_http_headers(target)).context("could not fetch headers")?;

    Ok(())
}
