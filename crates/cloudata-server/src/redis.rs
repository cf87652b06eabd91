//! Redis-wire front-end.
//!
//! Each command maps onto one or a few engine operations against the
//! session's selected keyspace. Connections carry their own [`Session`],
//! attached on the first command.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use cloudata_storage::{parse_decimal, Operation, OperationStore};
use cloudata_types::{ApplyResult, CloudataError, KeyspaceId, RejectReason, Value};

use crate::auth::Authenticator;
use crate::resp::{self, Frame};
use crate::session::{Connection, Session};

/// A command failure, rendered as a RESP error reply.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    Unknown(String),
    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(String),
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,
    #[error("ERR increment or decrement would overflow")]
    Overflow,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR precondition failed")]
    PreconditionFailed,
    #[error("NOAUTH Authentication required.")]
    NoAuth,
    #[error("WRONGPASS invalid username-password pair or user is disabled.")]
    WrongPass,
    #[error("ERR {0}")]
    Store(#[from] CloudataError),
}

enum Flow {
    Continue,
    Close,
}

/// Argument count bounds, excluding the command name.
fn arity(name: &str) -> Option<(usize, usize)> {
    Some(match name {
        "PING" => (0, 1),
        "QUIT" => (0, 0),
        "ECHO" | "SELECT" | "GET" | "INCR" | "DECR" => (1, 1),
        "AUTH" | "SET" | "SETNX" | "INCRBY" | "DECRBY" | "APPEND" => (2, 2),
        "CAS" => (3, 3),
        "DEL" => (1, usize::MAX),
        _ => return None,
    })
}

fn parse_i64(arg: &[u8]) -> Result<i64, CommandError> {
    parse_decimal(arg).ok_or(CommandError::NotAnInteger)
}

fn rejection(reason: RejectReason) -> CommandError {
    match reason {
        RejectReason::Overflow => CommandError::Overflow,
        RejectReason::WrongType => CommandError::WrongType,
        RejectReason::PreconditionFailed => CommandError::PreconditionFailed,
    }
}

pub struct RedisServer<S> {
    store: Arc<S>,
    auth: Authenticator<S>,
    default_keyspace: KeyspaceId,
    require_auth: bool,
    next_connection: AtomicU64,
}

impl<S: OperationStore> RedisServer<S> {
    /// Registers `default_keyspace` and the account keyspace if they are new.
    pub async fn new(
        store: Arc<S>,
        default_keyspace: &str,
        require_auth: bool,
    ) -> Result<Self, CloudataError> {
        let default_keyspace = store.register_keyspace(default_keyspace).await?;
        let auth = Authenticator::open(store.clone()).await?;
        Ok(RedisServer {
            store,
            auth,
            default_keyspace,
            require_auth,
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn authenticator(&self) -> &Authenticator<S> {
        &self.auth
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, require_auth = self.require_auth, "redis listener starting");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move { server.handle_connection(stream, peer).await });
        }
    }

    /// Serve one client until it disconnects, sends `QUIT` or breaks framing.
    pub async fn handle_connection<T>(&self, mut stream: T, peer: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let conn = Connection::new(self.next_connection.fetch_add(1, Ordering::Relaxed), peer);
        tracing::debug!(conn = conn.id(), %peer, "connection opened");

        let mut buffer = BytesMut::with_capacity(4096);
        let mut out = BytesMut::with_capacity(256);
        loop {
            match stream.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(conn = conn.id(), error = %e, "read failed");
                    break;
                }
            }

            let mut flow = Flow::Continue;
            loop {
                let (frame, used) = match resp::parse(&buffer) {
                    Ok(Some(parsed)) => parsed,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(conn = conn.id(), error = %e, "protocol error");
                        Frame::error(format!("ERR Protocol error: {e}")).encode(&mut out);
                        flow = Flow::Close;
                        break;
                    }
                };
                buffer.advance(used);
                let (reply, next) = match frame.into_args() {
                    Ok(args) => self.execute(&conn, args).await,
                    Err(e) => (Frame::error(format!("ERR Protocol error: {e}")), Flow::Continue),
                };
                reply.encode(&mut out);
                if let Flow::Close = next {
                    flow = Flow::Close;
                    break;
                }
            }

            if !out.is_empty() {
                if let Err(e) = stream.write_all(&out).await {
                    tracing::debug!(conn = conn.id(), error = %e, "write failed");
                    break;
                }
                out.clear();
            }
            if let Flow::Close = flow {
                break;
            }
        }
        let _ = stream.shutdown().await;
        tracing::debug!(conn = conn.id(), "connection closed");
    }

    async fn execute(&self, conn: &Connection, args: Vec<Bytes>) -> (Frame, Flow) {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let session = conn.session(self.default_keyspace);

        if name == "QUIT" {
            return (Frame::ok(), Flow::Close);
        }
        match self.dispatch(&session, &name, &args[1..]).await {
            Ok(reply) => (reply, Flow::Continue),
            Err(e) => {
                if let CommandError::Store(ref inner) = e {
                    tracing::warn!(conn = conn.id(), command = %name, error = %inner, "command failed");
                }
                (Frame::error(e.to_string()), Flow::Continue)
            }
        }
    }

    async fn dispatch(
        &self,
        session: &Session,
        name: &str,
        args: &[Bytes],
    ) -> Result<Frame, CommandError> {
        let (min, max) = arity(name).ok_or_else(|| CommandError::Unknown(name.to_lowercase()))?;
        if args.len() < min || args.len() > max {
            return Err(CommandError::Arity(name.to_lowercase()));
        }
        if self.require_auth && !session.is_authenticated() && name != "AUTH" {
            return Err(CommandError::NoAuth);
        }
        let ks = session.keyspace();

        match name {
            "PING" => Ok(match args.first() {
                Some(msg) => Frame::Bulk(msg.clone()),
                None => Frame::Simple("PONG".into()),
            }),
            "ECHO" => Ok(Frame::Bulk(args[0].clone())),
            "AUTH" => {
                let login = String::from_utf8_lossy(&args[0]);
                let password = String::from_utf8_lossy(&args[1]);
                if self.auth.check(&login, &password).await? {
                    session.authenticate(&login);
                    tracing::debug!(session = %session.id(), login = %login, "authenticated");
                    Ok(Frame::ok())
                } else {
                    Err(CommandError::WrongPass)
                }
            }
            "SELECT" => {
                let keyspace = String::from_utf8_lossy(&args[0]);
                let id = self.store.register_keyspace(&keyspace).await?;
                session.select(id);
                Ok(Frame::ok())
            }
            "GET" => Ok(match self.store.get(ks, &args[0]).await? {
                Some(v) => Frame::bulk(v.to_bytes()),
                None => Frame::Null,
            }),
            "SET" => {
                let value = Value::Bytes(args[1].to_vec());
                match self.store.apply(ks, &args[0], Operation::Set(value)).await? {
                    ApplyResult::Applied(_) => Ok(Frame::ok()),
                    ApplyResult::Rejected(r) => Err(rejection(r)),
                }
            }
            "SETNX" => {
                let value = Value::Bytes(args[1].to_vec());
                self.flag(ks, &args[0], Operation::SetIfAbsent(value)).await
            }
            "DEL" => {
                let mut removed = 0;
                for key in args {
                    if self.store.remove(ks, key).await? {
                        removed += 1;
                    }
                }
                Ok(Frame::Integer(removed))
            }
            "INCR" => self.increment(ks, &args[0], 1).await,
            "DECR" => self.increment(ks, &args[0], -1).await,
            "INCRBY" => self.increment(ks, &args[0], parse_i64(&args[1])?).await,
            "DECRBY" => {
                let delta = parse_i64(&args[1])?.checked_neg().ok_or(CommandError::Overflow)?;
                self.increment(ks, &args[0], delta).await
            }
            "APPEND" => {
                let op = Operation::Append(args[1].to_vec());
                match self.store.apply(ks, &args[0], op).await? {
                    ApplyResult::Applied(v) => {
                        Ok(Frame::Integer(v.map_or(0, |v| v.to_bytes().len()) as i64))
                    }
                    ApplyResult::Rejected(r) => Err(rejection(r)),
                }
            }
            "CAS" => self.compare_and_set(ks, &args[0], &args[1], &args[2]).await,
            _ => Err(CommandError::Unknown(name.to_lowercase())),
        }
    }

    async fn increment(&self, ks: KeyspaceId, key: &[u8], delta: i64) -> Result<Frame, CommandError> {
        match self.store.apply(ks, key, Operation::Increment(delta)).await? {
            ApplyResult::Applied(Some(Value::Int(n))) => Ok(Frame::Integer(n)),
            ApplyResult::Applied(_) => Err(CommandError::NotAnInteger),
            ApplyResult::Rejected(RejectReason::WrongType) => Err(CommandError::NotAnInteger),
            ApplyResult::Rejected(r) => Err(rejection(r)),
        }
    }

    /// `:1` if the operation applied, `:0` if its precondition failed.
    async fn flag(&self, ks: KeyspaceId, key: &[u8], op: Operation) -> Result<Frame, CommandError> {
        match self.store.apply(ks, key, op).await? {
            ApplyResult::Applied(_) => Ok(Frame::Integer(1)),
            ApplyResult::Rejected(RejectReason::PreconditionFailed) => Ok(Frame::Integer(0)),
            ApplyResult::Rejected(r) => Err(rejection(r)),
        }
    }

    /// Compare against the value as a client sees it. A counter stored as an
    /// integer matches its canonical decimal rendering.
    async fn compare_and_set(
        &self,
        ks: KeyspaceId,
        key: &[u8],
        expected: &[u8],
        new: &[u8],
    ) -> Result<Frame, CommandError> {
        let new = Value::Bytes(new.to_vec());
        let as_bytes =
            Operation::CompareAndSet { expected: Value::Bytes(expected.to_vec()), new: new.clone() };
        let first = self.flag(ks, key, as_bytes).await?;
        if first == Frame::Integer(1) {
            return Ok(first);
        }
        match parse_decimal(expected) {
            Some(n) => {
                self.flag(ks, key, Operation::CompareAndSet { expected: Value::Int(n), new }).await
            }
            None => Ok(first),
        }
    }
}

#[cfg(test)]
mod tests {
    use cloudata_storage::{Engine, MemBackend};
    use tokio::io::duplex;

    use super::*;

    type TestServer = RedisServer<Engine<MemBackend>>;

    async fn server(require_auth: bool) -> Arc<TestServer> {
        let engine = Arc::new(Engine::open(Arc::new(MemBackend::new())).unwrap());
        Arc::new(RedisServer::new(engine, "default", require_auth).await.unwrap())
    }

    fn command(parts: &[&str]) -> Vec<u8> {
        let frame = Frame::Array(parts.iter().map(|p| Frame::bulk(p.as_bytes().to_vec())).collect());
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.to_vec()
    }

    /// Run commands on one connection and collect the raw reply bytes.
    async fn run<S: OperationStore>(server: &Arc<RedisServer<S>>, commands: &[&[&str]]) -> String {
        let (mut client, remote) = duplex(64 * 1024);
        let srv = server.clone();
        let handle = tokio::spawn(async move {
            srv.handle_connection(remote, "127.0.0.1:1".parse().unwrap()).await
        });

        for parts in commands {
            client.write_all(&command(parts)).await.unwrap();
        }
        client.write_all(&command(&["QUIT"])).await.unwrap();
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        handle.await.unwrap();
        String::from_utf8(replies).unwrap()
    }

    #[tokio::test]
    async fn basic_commands() {
        let srv = server(false).await;
        let out = run(
            &srv,
            &[
                &["PING"],
                &["echo", "hi"],
                &["SET", "k", "v"],
                &["GET", "k"],
                &["GET", "missing"],
                &["APPEND", "k", "w"],
                &["SETNX", "k", "x"],
                &["SETNX", "fresh", "x"],
                &["DEL", "k", "fresh", "never"],
                &["GET", "k"],
            ],
        )
        .await;
        assert_eq!(
            out,
            "+PONG\r\n$2\r\nhi\r\n+OK\r\n$1\r\nv\r\n$-1\r\n:2\r\n:0\r\n:1\r\n:2\r\n$-1\r\n+OK\r\n"
        );
    }

    #[tokio::test]
    async fn counters() {
        let srv = server(false).await;
        let out = run(
            &srv,
            &[
                &["INCR", "n"],
                &["INCRBY", "n", "41"],
                &["DECR", "n"],
                &["DECRBY", "n", "1"],
                &["GET", "n"],
                &["INCRBY", "n", "abc"],
                &["SET", "text", "hello"],
                &["INCR", "text"],
                &["SET", "big", "9223372036854775807"],
                &["INCR", "big"],
                &["APPEND", "n", "x"],
            ],
        )
        .await;
        assert_eq!(
            out,
            concat!(
                ":1\r\n:42\r\n:41\r\n:40\r\n$2\r\n40\r\n",
                "-ERR value is not an integer or out of range\r\n",
                "+OK\r\n-ERR value is not an integer or out of range\r\n",
                "+OK\r\n-ERR increment or decrement would overflow\r\n",
                "-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
                "+OK\r\n"
            )
        );
    }

    #[tokio::test]
    async fn integers_must_be_canonical() {
        let srv = server(false).await;
        let out = run(
            &srv,
            &[
                &["INCRBY", "n", "+5"],
                &["INCRBY", "n", "007"],
                &["DECRBY", "n", "-0"],
                &["SET", "padded", "007"],
                &["INCR", "padded"],
                &["SET", "plus", "+1"],
                &["INCR", "plus"],
                &["INCRBY", "n", "-7"],
            ],
        )
        .await;
        let not_int = "-ERR value is not an integer or out of range\r\n";
        assert_eq!(
            out,
            [not_int, not_int, not_int, "+OK\r\n", not_int, "+OK\r\n", not_int, ":-7\r\n", "+OK\r\n"]
                .concat()
        );
    }

    #[tokio::test]
    async fn compare_and_set() {
        let srv = server(false).await;
        let out = run(
            &srv,
            &[
                &["CAS", "lock", "free", "me"],
                &["SET", "lock", "free"],
                &["CAS", "lock", "taken", "me"],
                &["CAS", "lock", "free", "me"],
                &["GET", "lock"],
                &["INCRBY", "ctr", "5"],
                &["CAS", "ctr", "05", "x"],
                &["CAS", "ctr", "5", "x"],
                &["GET", "ctr"],
            ],
        )
        .await;
        assert_eq!(
            out,
            ":0\r\n+OK\r\n:0\r\n:1\r\n$2\r\nme\r\n:5\r\n:0\r\n:1\r\n$1\r\nx\r\n+OK\r\n"
        );
    }

    #[tokio::test]
    async fn select_isolates_keyspaces() {
        let srv = server(false).await;
        let out = run(
            &srv,
            &[
                &["SET", "k", "default"],
                &["SELECT", "gitrefs"],
                &["GET", "k"],
                &["SET", "k", "refs"],
                &["SELECT", "default"],
                &["GET", "k"],
            ],
        )
        .await;
        assert_eq!(out, "+OK\r\n+OK\r\n$-1\r\n+OK\r\n+OK\r\n$7\r\ndefault\r\n+OK\r\n");

        // Selection is per connection.
        let out = run(&srv, &[&["GET", "k"]]).await;
        assert_eq!(out, "$7\r\ndefault\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn auth_is_required_and_sticks() {
        let srv = server(true).await;
        srv.authenticator().ensure_user("alice", "s3cret").await.unwrap();

        let out = run(
            &srv,
            &[
                &["GET", "k"],
                &["AUTH", "alice", "wrong"],
                &["AUTH", "alice", "s3cret"],
                &["SET", "k", "v"],
                &["GET", "k"],
            ],
        )
        .await;
        assert_eq!(
            out,
            concat!(
                "-NOAUTH Authentication required.\r\n",
                "-WRONGPASS invalid username-password pair or user is disabled.\r\n",
                "+OK\r\n+OK\r\n$1\r\nv\r\n+OK\r\n"
            )
        );

        // A new connection starts unauthenticated.
        let out = run(&srv, &[&["PING"]]).await;
        assert_eq!(out, "-NOAUTH Authentication required.\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn command_errors() {
        let srv = server(false).await;
        let out = run(&srv, &[&["FLUSHALL"], &["GET"], &["CAS", "a", "b"], &["SELECT", ""]]).await;
        assert_eq!(
            out,
            concat!(
                "-ERR unknown command 'flushall'\r\n",
                "-ERR wrong number of arguments for 'get' command\r\n",
                "-ERR wrong number of arguments for 'cas' command\r\n",
                "-ERR invalid argument: keyspace name must not be empty\r\n",
                "+OK\r\n"
            )
        );
    }

    #[tokio::test]
    async fn inline_and_pipelined_input() {
        let srv = server(false).await;
        let (mut client, remote) = duplex(4096);
        let srv2 = srv.clone();
        let handle = tokio::spawn(async move {
            srv2.handle_connection(remote, "127.0.0.1:2".parse().unwrap()).await
        });

        client.write_all(b"SET a 1\r\nINCR a\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\nQUIT\r\n").await.unwrap();
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        handle.await.unwrap();
        assert_eq!(replies, b"+OK\r\n:2\r\n$1\r\n2\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn protocol_error_closes_connection() {
        let srv = server(false).await;
        let (mut client, remote) = duplex(4096);
        let srv2 = srv.clone();
        let handle = tokio::spawn(async move {
            srv2.handle_connection(remote, "127.0.0.1:3".parse().unwrap()).await
        });

        client.write_all(b"PING\r\n*1\r\n$x\r\n").await.unwrap();
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        handle.await.unwrap();
        assert_eq!(replies, b"+PONG\r\n-ERR Protocol error: invalid bulk length\r\n");
    }

    #[tokio::test]
    async fn endless_inline_line_closes_connection() {
        let srv = server(false).await;
        let (mut client, remote) = duplex(4096);
        let srv2 = srv.clone();
        let handle = tokio::spawn(async move {
            srv2.handle_connection(remote, "127.0.0.1:4".parse().unwrap()).await
        });

        // The server hangs up part way through, so the write may fail.
        let _ = client.write_all(&vec![b'a'; resp::MAX_INLINE_LEN * 2]).await;
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        handle.await.unwrap();
        let replies = String::from_utf8(replies).unwrap();
        assert!(
            replies.starts_with("-ERR Protocol error: inline command too large"),
            "{replies}"
        );
        assert!(replies.ends_with("\r\n"));
    }

    /// Holds every `remove` until two are in flight at once.
    struct PairedRemoves {
        engine: Engine<MemBackend>,
        gate: tokio::sync::Barrier,
    }

    impl OperationStore for PairedRemoves {
        async fn apply(
            &self,
            keyspace: KeyspaceId,
            key: &[u8],
            op: Operation,
        ) -> Result<ApplyResult, CloudataError> {
            self.engine.apply(keyspace, key, op).await
        }

        async fn remove(&self, keyspace: KeyspaceId, key: &[u8]) -> Result<bool, CloudataError> {
            self.gate.wait().await;
            self.engine.remove(keyspace, key).await
        }

        async fn get(&self, keyspace: KeyspaceId, key: &[u8]) -> Result<Option<Value>, CloudataError> {
            self.engine.get(keyspace, key).await
        }

        async fn register_keyspace(&self, name: &str) -> Result<KeyspaceId, CloudataError> {
            self.engine.register_keyspace(name).await
        }

        fn resolve_keyspace(&self, name: &str) -> Result<KeyspaceId, CloudataError> {
            self.engine.resolve_keyspace(name)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_del_counts_a_key_once() {
        let engine = Engine::open(Arc::new(MemBackend::new())).unwrap();
        let store = Arc::new(PairedRemoves { engine: engine.clone(), gate: tokio::sync::Barrier::new(2) });
        let srv = Arc::new(RedisServer::new(store, "default", false).await.unwrap());
        let ks = engine.resolve_keyspace("default").unwrap();

        for _ in 0..10 {
            assert_eq!(run(&srv, &[&["SET", "k", "v"]]).await, "+OK\r\n+OK\r\n");
            let (a, b) = tokio::join!(run(&srv, &[&["DEL", "k"]]), run(&srv, &[&["DEL", "k"]]));
            let mut replies = [a, b];
            replies.sort();
            assert_eq!(replies, [":0\r\n+OK\r\n", ":1\r\n+OK\r\n"]);
        }

        let deletes = engine
            .log_for_key(ks, b"k")
            .await
            .unwrap()
            .into_iter()
            .filter(|(_, e)| e.action == cloudata_storage::LogAction::Delete)
            .count();
        assert_eq!(deletes, 10);
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let srv = server(false).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv2 = srv.clone();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            srv2.handle_connection(stream, peer).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(&command(&["SET", "k", "v"])).await.unwrap();
        client.write_all(&command(&["GET", "k"])).await.unwrap();
        client.write_all(&command(&["QUIT"])).await.unwrap();
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, b"+OK\r\n$1\r\nv\r\n+OK\r\n");
    }
}
