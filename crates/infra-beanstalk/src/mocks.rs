// In-process fake beanstalkd for tests
//
// Speaks just enough of the protocol for the manager: use, watch, ignore, put,
// reserve-with-timeout, delete, quit. All tubes share one ready list.

use conveyor_core::domain::JobId;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
struct FakeState {
    ready: VecDeque<(JobId, Vec<u8>)>,
    reserved: HashMap<JobId, Vec<u8>>,
    deleted: Vec<JobId>,
    tubes_used: Vec<String>,
    next_id: JobId,
    connections: usize,
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> std::sync::MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FakeBeanstalkd {
    addr: SocketAddr,
    state: Shared,
    kick: Arc<watch::Sender<u64>>,
    accept: JoinHandle<()>,
}

impl FakeBeanstalkd {
    /// Bind an ephemeral local port and start accepting
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state: Shared = Arc::default();
        let kick = Arc::new(watch::channel(0u64).0);

        let accept = {
            let state = Arc::clone(&state);
            let kick = Arc::clone(&kick);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    lock(&state).connections += 1;
                    let state = Arc::clone(&state);
                    let kicked = kick.subscribe();
                    tokio::spawn(serve(socket, state, kicked));
                }
            })
        };

        Ok(Self {
            addr,
            state,
            kick,
            accept,
        })
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Enqueue a job as if another producer had put it
    pub fn push(&self, body: impl Into<Vec<u8>>) -> JobId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.ready.push_back((id, body.into()));
        id
    }

    pub fn ready_len(&self) -> usize {
        lock(&self.state).ready.len()
    }

    pub fn deleted(&self) -> Vec<JobId> {
        lock(&self.state).deleted.clone()
    }

    /// Tube names received in `use` commands, in order
    pub fn tubes_used(&self) -> Vec<String> {
        lock(&self.state).tubes_used.clone()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    /// Close every open client socket; the listener keeps accepting
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeBeanstalkd {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_connections();
    }
}

async fn serve(socket: TcpStream, state: Shared, mut kicked: watch::Receiver<u64>) {
    let mut stream = BufStream::new(socket);
    loop {
        let mut line = String::new();
        let read = tokio::select! {
            biased;
            _ = kicked.changed() => return,
            read = stream.read_line(&mut line) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let command = line.trim_end_matches(['\r', '\n']).to_string();
        let reply = match handle(&command, &mut stream, &state).await {
            Some(reply) => reply,
            None => return,
        };
        if stream.write_all(&reply).await.is_err() || stream.flush().await.is_err() {
            return;
        }
    }
}

async fn handle(command: &str, stream: &mut BufStream<TcpStream>, state: &Shared) -> Option<Vec<u8>> {
    let parts: Vec<&str> = command.split(' ').collect();
    let reply = match parts.as_slice() {
        ["use", tube] => {
            lock(state).tubes_used.push(tube.to_string());
            format!("USING {tube}\r\n").into_bytes()
        }
        ["watch", _] => b"WATCHING 2\r\n".to_vec(),
        ["ignore", _] => b"WATCHING 1\r\n".to_vec(),
        ["put", _pri, _delay, _ttr, bytes] => {
            let len: usize = bytes.parse().ok()?;
            let mut body = vec![0u8; len + 2];
            stream.read_exact(&mut body).await.ok()?;
            body.truncate(len);

            let mut state = lock(state);
            state.next_id += 1;
            let id = state.next_id;
            state.ready.push_back((id, body));
            format!("INSERTED {id}\r\n").into_bytes()
        }
        ["reserve-with-timeout", secs] => {
            let secs: u64 = secs.parse().ok()?;
            let deadline = Instant::now() + Duration::from_secs(secs);
            loop {
                let next = {
                    let mut state = lock(state);
                    let next = state.ready.pop_front();
                    if let Some((id, body)) = &next {
                        state.reserved.insert(*id, body.clone());
                    }
                    next
                };
                if let Some((id, body)) = next {
                    let mut reply = format!("RESERVED {id} {}\r\n", body.len()).into_bytes();
                    reply.extend_from_slice(&body);
                    reply.extend_from_slice(b"\r\n");
                    break reply;
                }
                if Instant::now() >= deadline {
                    break b"TIMED_OUT\r\n".to_vec();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        ["delete", id] => {
            let id: JobId = id.parse().ok()?;
            let mut state = lock(state);
            if state.reserved.remove(&id).is_some() {
                state.deleted.push(id);
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        ["quit"] => return None,
        _ => b"UNKNOWN_COMMAND\r\n".to_vec(),
    };
    Some(reply)
}
