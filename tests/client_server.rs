use clonecache::client::ClientAgent;
use clonecache::config::ClusterConfig;
use clonecache::durable::DurableStore;
use clonecache::server::run_server;
use std::io::Write;
use std::time::Duration;
use tempfile::tempdir;

fn write_standalone_primary_config(
    dir: &std::path::Path,
    port: u16,
    peer_port: u16,
    bstar_local: u16,
    bstar_remote: u16,
) -> std::path::PathBuf {
    let global_path = dir.join("cluster.conf");
    let mut global = std::fs::File::create(&global_path).unwrap();
    writeln!(global, "primary=TRUE").unwrap();
    writeln!(global, "logPath={}", dir.join("clone.log").display()).unwrap();
    writeln!(global, "ClusterName=itest").unwrap();
    writeln!(global, "ServerType=kv").unwrap();
    writeln!(global, "bstarLocal=127.0.0.1:{}", bstar_local).unwrap();
    writeln!(global, "bstarRemote=127.0.0.1:{}", bstar_remote).unwrap();
    writeln!(global, "baseidstrs=A").unwrap();
    drop(global);

    let base_path = dir.join("cluster.conf.A");
    let mut base = std::fs::File::create(&base_path).unwrap();
    writeln!(base, "port={}", port).unwrap();
    writeln!(base, "peer={}", peer_port).unwrap();
    writeln!(base, "databasePath={}", dir.join("db").display()).unwrap();
    writeln!(base, "cacheids=c0").unwrap();
    writeln!(base, "bstarReceptor=n/a").unwrap();
    writeln!(base, "addressprimary=127.0.0.1").unwrap();
    writeln!(base, "portprimary={}", port).unwrap();
    writeln!(base, "addressbackup=127.0.0.1").unwrap();
    writeln!(base, "portbackup={}", peer_port).unwrap();
    drop(base);

    global_path
}

/// A lone primary (no reachable backup) should become ACTIVE on its first
/// snapshot request, serve a client's bootstrap, and replicate a SET back
/// into the client's local cache via the publisher bus.
#[tokio::test]
async fn standalone_primary_serves_set_and_get() {
    let dir = tempdir().unwrap();
    let config_path = write_standalone_primary_config(dir.path(), 19561, 19661, 19701, 19702);
    let config = ClusterConfig::load(&config_path).unwrap();
    let db_path = config.bases["A"].database_path.join("c0");

    let server = tokio::spawn(run_server(config));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let agent = ClientAgent::new(Vec::new());
    agent
        .connect("127.0.0.1:19561".parse().unwrap())
        .await
        .expect("connect");
    tokio::time::sleep(Duration::from_millis(300)).await;

    agent
        .set("c0", b"hello".to_vec(), b"world".to_vec(), 0)
        .await
        .expect("set");
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(
        agent.get("c0", "hello").await.unwrap(),
        Some(b"world".to_vec())
    );

    agent.shutdown().await.unwrap();
    server.abort();

    // The SET must also have landed in the durable mirror.
    let durable = DurableStore::open(&db_path).unwrap();
    assert_eq!(durable.get("hello").unwrap(), Some(b"world".to_vec()));
}

/// A key with a short TTL should disappear from the client's replicated
/// cache once the server's flush timer fires.
#[tokio::test]
async fn ttl_expiry_propagates_to_clients() {
    let dir = tempdir().unwrap();
    let config_path = write_standalone_primary_config(dir.path(), 19563, 19663, 19703, 19704);
    let config = ClusterConfig::load(&config_path).unwrap();

    let server = tokio::spawn(run_server(config));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let agent = ClientAgent::new(Vec::new());
    agent
        .connect("127.0.0.1:19563".parse().unwrap())
        .await
        .expect("connect");
    tokio::time::sleep(Duration::from_millis(300)).await;

    agent
        .set("c0", b"eph".to_vec(), b"x".to_vec(), 1)
        .await
        .expect("set");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.get("c0", "eph").await.unwrap(), Some(b"x".to_vec()));

    // Past the 1-second TTL plus one flush cycle.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(agent.get("c0", "eph").await.unwrap(), None);

    agent.shutdown().await.unwrap();
    server.abort();
}
