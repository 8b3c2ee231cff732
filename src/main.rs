use clap::Parser;
use kademlia::*;
use std::{error::Error, net::SocketAddr};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, Level};

const HELP: &str = r"
help                          ..print this message
quit                          ..shut the node down and exit
get_node_id                   ..print the local node id
get_contact <id>              ..print a contact from the routing table
routes                        ..print the non-empty buckets
get_local_value <key>         ..print a value stored on this node
======\/ single requests \/======
ping <host:port>|<id>         ..pings a node
store <id> <key> <value>      ..sends a store request to a node
find_node <id> <key>          ..sends a find_node request to a node
find_value <id> <key>         ..sends a find_value request to a node
======\/ iterative \/======
iterativeFindNode <id>        ..finds the k closest nodes to id
iterativeStore <key> <value>  ..stores value on the k closest nodes to key
iterativeFindValue <key>      ..looks value up in the network
";

#[derive(Parser, Debug)]
#[command(version, about = "Kademlia DHT node")]
struct Args {
    /// Address the node listens on
    #[arg(short, long, default_value = "localhost:7890", value_parser = parse_addr)]
    listen: SocketAddr,

    /// Known node to join through, as <id>@<host:port>
    #[arg(short, long)]
    bootstrap: Vec<Contact>,

    /// Maximum level of log output
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command {0:?}, try help")]
    Unknown(String),
    #[error("invalid key: {0}")]
    BadKey(#[from] const_hex::FromHexError),
    #[error(transparent)]
    BadAddr(#[from] ParseAddrError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("no value stored under {0}")]
    NoValue(DHTKey),
}

enum Reply {
    Ok(String),
    Quit,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut builder = Kademlia::builder();
    builder.listen(args.listen).bootstrap(args.bootstrap);
    let node = builder.start().await?;

    println!("OK: {}", node.contact());

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }

        match execute(&node, &args).await {
            Ok(Reply::Ok(out)) => println!("OK: {}", out),
            Ok(Reply::Quit) => break,
            Err(e) => println!("ERR: {}", e),
        }
    }

    node.shutdown().await;
    Ok(())
}

fn id(s: &str) -> Result<DHTKey, CommandError> {
    Ok(s.parse()?)
}

/// Value keys may be given as hex or as any string, which is hashed.
fn key(s: &str) -> DHTKey {
    s.parse().unwrap_or_else(|_| DHTKey::hash(s.as_bytes()))
}

/// Resolves an id to a known contact.
fn contact(node: &Kademlia, s: &str) -> Result<Contact, CommandError> {
    Ok(node.find_contact(&id(s)?)?)
}

fn list(contacts: &[Contact]) -> String {
    contacts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn buckets(table: &RoutingTable) -> String {
    (0..N_BUCKETS)
        .filter_map(|index| {
            let bucket = table.bucket(index).filter(|b| !b.is_empty())?;
            let contacts: Vec<Contact> = bucket.iter().copied().collect();
            Some(format!("[{}] {}", index, list(&contacts)))
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

async fn execute(node: &Kademlia, args: &[&str]) -> Result<Reply, CommandError> {
    debug!("command: {:?}", args);

    let out = match args {
        ["h" | "help"] => HELP.to_owned(),
        ["q" | "quit"] => return Ok(Reply::Quit),
        ["get_node_id"] => node.id().to_string(),
        ["get_contact", peer] => contact(node, peer)?.to_string(),
        ["routes"] => buckets(&node.routes()),
        ["get_local_value", k] => {
            let k = key(k);
            let value = node
                .local_value(&k)
                .await
                .ok_or(CommandError::NoValue(k))?;
            String::from_utf8_lossy(&value).into_owned()
        }
        ["ping", dst] if dst.contains(':') => node.ping_addr(parse_addr(dst)?).await?.to_string(),
        ["ping", peer] => {
            let dst = contact(node, peer)?;
            node.ping(&dst).await?;
            dst.to_string()
        }
        ["store", peer, k, value] => {
            let dst = contact(node, peer)?;
            node.store(&dst, key(k), value.as_bytes().to_vec()).await?;
            format!("stored on {}", dst)
        }
        ["find_node", peer, k] => {
            let dst = contact(node, peer)?;
            list(&node.find_node(&dst, &key(k)).await?)
        }
        ["find_value", peer, k] => {
            let dst = contact(node, peer)?;
            match node.find_value(&dst, &key(k)).await? {
                FoundValue::Value(value) => String::from_utf8_lossy(&value).into_owned(),
                FoundValue::Nodes(nodes) => list(&nodes),
            }
        }
        ["iterativeFindNode", target] => list(&node.lookup_nodes(&id(target)?).await),
        ["iterativeStore", k, value] => {
            let stored = node.put(key(k), value.as_bytes().to_vec()).await;
            format!("stored on {} nodes", stored.len())
        }
        ["iterativeFindValue", k] => {
            let k = key(k);
            let value = node.get(&k).await.ok_or(CommandError::NoValue(k))?;
            String::from_utf8_lossy(&value).into_owned()
        }
        ["ping", ..] => return Err(CommandError::Usage("ping <host:port>|<id>")),
        ["store", ..] => return Err(CommandError::Usage("store <id> <key> <value>")),
        ["find_node", ..] => return Err(CommandError::Usage("find_node <id> <key>")),
        ["find_value", ..] => return Err(CommandError::Usage("find_value <id> <key>")),
        ["get_contact", ..] => return Err(CommandError::Usage("get_contact <id>")),
        ["get_local_value", ..] => return Err(CommandError::Usage("get_local_value <key>")),
        ["iterativeFindNode", ..] => return Err(CommandError::Usage("iterativeFindNode <id>")),
        ["iterativeStore", ..] => {
            return Err(CommandError::Usage("iterativeStore <key> <value>"))
        }
        ["iterativeFindValue", ..] => {
            return Err(CommandError::Usage("iterativeFindValue <key>"))
        }
        [cmd, ..] => return Err(CommandError::Unknown(cmd.to_string())),
        [] => return Err(CommandError::Unknown(String::new())),
    };

    Ok(Reply::Ok(out))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    async fn start() -> Kademlia {
        let mut builder = Kademlia::builder();
        builder.listen("127.0.0.1:0".parse().unwrap());
        builder.start().await.unwrap()
    }

    #[tokio::test]
    async fn routes_lists_known_contacts_by_bucket() {
        let a = start().await;
        let b = start().await;
        assert_eq!(buckets(&a.routes()), "");

        a.ping_addr(b.contact().addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while a.find_contact(b.id()).is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let index = a.routes().bucket_index(b.id()).unwrap();
        let Ok(Reply::Ok(out)) = execute(&a, &["routes"]).await else {
            panic!("routes failed");
        };
        assert_eq!(out, format!("[{}] {}", index, b.contact()));

        a.shutdown().await;
        b.shutdown().await;
    }
}
