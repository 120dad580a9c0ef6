pub mod components;
pub mod room;

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use futures_util::{stream::BoxStream, StreamExt};
use tokio::{
    sync::{mpsc, Mutex},
    task::{AbortHandle, JoinHandle},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::{components::Entity, room::Room};
use crate::{
    api::{
        close_codes::{ERR_INVALID_ROOM, ERR_TOO_MANY_ROOMS_CREATED},
        protocol::{Request, Response, Update},
    },
    rate_limiting::RateLimiter,
    store::{mutate_fn, Mutation, RoomStore},
    Error, Result,
};

/// How often a request is retried when it loses the room lock race.
pub const MAX_UPDATE_RETRIES: u32 = 3;

/// How long a ping stays on the board.
pub const PING_LENGTH: Duration = Duration::from_secs(3);

type ResponseQueue = mpsc::UnboundedSender<Result<Response>>;

/// Node-local actor state for one room: the replicated board, the response
/// queues of every connection subscribed on this node, and the tasks bound
/// to the room's lifetime.
struct RoomContext {
    room: StdMutex<Room>,
    subscribers: StdMutex<Vec<(String, ResponseQueue)>>,
    feed_task: StdMutex<Option<JoinHandle<()>>>,
    ping_tasks: StdMutex<Vec<AbortHandle>>,
    failed: AtomicBool,
}

pub struct Service {
    room_store: Arc<dyn RoomStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    rooms: Mutex<HashMap<String, Arc<RoomContext>>>,
}

impl Service {
    pub fn build(room_store: Arc<dyn RoomStore>, rate_limiter: Arc<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            room_store,
            rate_limiter,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Handles one accepted client connection to a room.
    ///
    /// Reserves rate-limit slots, joins (or creates) the node-local room
    /// actor, then pumps: inbound requests become store mutations, and
    /// committed mutations from the change feed flow back out. The first
    /// item of the returned stream is always `connected` with the current
    /// snapshot; an `Err` item means the connection must be closed with
    /// that error's close code.
    #[tracing::instrument(skip(self, requests))]
    pub async fn handle_connection(
        self: &Arc<Self>,
        room_id: String,
        client_ip: IpAddr,
        requests: BoxStream<'static, Result<Request>>,
    ) -> Result<UnboundedReceiverStream<Result<Response>>> {
        let session_id = Uuid::new_v4().to_string();
        info!(%session_id, "Connected to {client_ip}");

        let guard = self
            .rate_limiter
            .acquire_connection(client_ip, &room_id)
            .await?;
        let ctx = self.room_context(&room_id, client_ip).await?;

        let (queue_tx, mut queue) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        // Registration and snapshot happen under the subscriber lock the
        // feed task also takes, so a mutation lands either in the snapshot
        // or in the queue, never in neither.
        let snapshot = {
            let mut subscribers = ctx.subscribers.lock().unwrap();
            subscribers.push((session_id.clone(), queue_tx));
            ctx.room.lock().unwrap().snapshot()
        };
        let _ = out_tx.send(Ok(Response::Connected { data: snapshot }));

        let service = Arc::clone(self);
        let ctx_task = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _guard = guard;
            let mut requests = requests;
            loop {
                tokio::select! {
                    response = queue.recv() => match response {
                        Some(Ok(response)) => {
                            if out_tx.send(Ok(response)).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = out_tx.send(Err(e));
                            break;
                        }
                        None => break,
                    },
                    request = requests.next() => match request {
                        Some(Ok(request)) => {
                            if let Err(e) = service
                                .apply_request(&room_id, &session_id, &ctx_task, request)
                                .await
                            {
                                let _ = out_tx.send(Err(e));
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = out_tx.send(Err(e));
                            break;
                        }
                        None => break,
                    },
                }
            }
            service.unsubscribe(&room_id, &ctx_task, &session_id).await;
        });

        Ok(UnboundedReceiverStream::new(out_rx))
    }

    /// Joins the node-local context for the room, creating it (and its
    /// change feed task) on first use.
    async fn room_context(
        self: &Arc<Self>,
        room_id: &str,
        client_ip: IpAddr,
    ) -> Result<Arc<RoomContext>> {
        let mut rooms = self.rooms.lock().await;
        if let Some(ctx) = rooms.get(room_id) {
            if ctx.failed.load(Ordering::Relaxed) {
                // The feed died; tear the context down and rebuild it.
                if let Some(task) = ctx.feed_task.lock().unwrap().take() {
                    task.abort();
                }
                rooms.remove(room_id);
            } else {
                return Ok(Arc::clone(ctx));
            }
        }

        self.rate_limiter
            .acquire_new_room(client_ip)
            .await
            .map_err(|e| match e {
                Error::TooManyRoomsCreated => {
                    info!(%client_ip, "Rejecting connection, too many rooms created recently");
                    Error::InvalidConnection {
                        code: ERR_TOO_MANY_ROOMS_CREATED,
                        reason: "Too many rooms created by client".to_owned(),
                    }
                }
                other => other,
            })?;

        // Subscribe before reading: a mutation that slips between the two
        // shows up on the feed as a full snapshot and simply resets the
        // room again.
        let changes = self.room_store.changes(room_id).await?;
        let entities = self.room_store.read(room_id).await?.unwrap_or_default();

        let ctx = Arc::new(RoomContext {
            room: StdMutex::new(Room::new(entities)),
            subscribers: StdMutex::new(Vec::new()),
            feed_task: StdMutex::new(None),
            ping_tasks: StdMutex::new(Vec::new()),
            failed: AtomicBool::new(false),
        });
        let task = tokio::spawn(Self::listen_for_changes(Arc::clone(&ctx), changes));
        *ctx.feed_task.lock().unwrap() = Some(task);
        rooms.insert(room_id.to_owned(), Arc::clone(&ctx));
        debug!(%room_id, "Created room context");
        Ok(ctx)
    }

    /// Applies every committed mutation to the local room copy and fans its
    /// responses out to all subscribed connections, in commit order.
    async fn listen_for_changes(
        ctx: Arc<RoomContext>,
        mut changes: BoxStream<'static, Result<Mutation>>,
    ) {
        while let Some(item) = changes.next().await {
            match item {
                Ok(mutation) => {
                    let subscribers = ctx.subscribers.lock().unwrap();
                    ctx.room.lock().unwrap().reset(mutation.entities);
                    for response in mutation.responses {
                        for (_, queue) in subscribers.iter() {
                            let _ = queue.send(Ok(response.clone()));
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Change feed failed, dropping every subscriber");
                    ctx.failed.store(true, Ordering::Relaxed);
                    let subscribers = ctx.subscribers.lock().unwrap();
                    for (_, queue) in subscribers.iter() {
                        let _ = queue.send(Err(Error::InvalidConnection {
                            code: ERR_INVALID_ROOM,
                            reason: "The room's change feed was interrupted".to_owned(),
                        }));
                    }
                    return;
                }
            }
        }
    }

    async fn apply_request(
        self: &Arc<Self>,
        room_id: &str,
        session_id: &str,
        ctx: &Arc<RoomContext>,
        request: Request,
    ) -> Result<()> {
        let ping_ids: Vec<String> = request
            .updates
            .iter()
            .filter_map(|update| match update {
                Update::Ping { data } => Some(data.id.clone()),
                _ => None,
            })
            .collect();

        let mut attempt = 0;
        loop {
            let request_copy = request.clone();
            let session = session_id.to_owned();
            let outcome = self
                .room_store
                .apply_mutation(
                    room_id,
                    mutate_fn(move |entities| async move {
                        Ok(apply_updates(
                            entities.unwrap_or_default(),
                            &request_copy,
                            &session,
                        ))
                    }),
                )
                .await;

            match outcome {
                Ok(_) => {
                    if !ping_ids.is_empty() {
                        self.schedule_ping_expiry(
                            room_id,
                            ctx,
                            request.request_id.clone(),
                            ping_ids,
                        );
                    }
                    return Ok(());
                }
                Err(Error::TransactionFailed(_)) => {
                    attempt += 1;
                    if attempt >= MAX_UPDATE_RETRIES {
                        error!(%room_id, "Request still failing after {MAX_UPDATE_RETRIES} attempts, dropping the connection");
                        return Err(Error::InvalidConnection {
                            code: ERR_INVALID_ROOM,
                            reason: "The room could not be updated".to_owned(),
                        });
                    }
                    warn!(%room_id, attempt, "Mutation hit a concurrent writer, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Schedules the follow-up mutation that removes a request's pings. The
    /// task lives on the room context and dies with it.
    fn schedule_ping_expiry(
        self: &Arc<Self>,
        room_id: &str,
        ctx: &Arc<RoomContext>,
        request_id: String,
        ping_ids: Vec<String>,
    ) {
        let service = Arc::clone(self);
        let room_id = room_id.to_owned();
        let task = tokio::spawn(async move {
            tokio::time::sleep(PING_LENGTH).await;
            for _ in 0..MAX_UPDATE_RETRIES {
                let request_id = request_id.clone();
                let ping_ids = ping_ids.clone();
                let outcome = service
                    .room_store
                    .apply_mutation(
                        &room_id,
                        mutate_fn(move |entities| async move {
                            let mut room = Room::new(entities.unwrap_or_default());
                            for ping_id in &ping_ids {
                                room.remove_ping(ping_id);
                            }
                            let entities = room.snapshot();
                            Ok(Mutation {
                                entities: entities.clone(),
                                responses: vec![Response::State {
                                    data: entities,
                                    request_id,
                                }],
                            })
                        }),
                    )
                    .await;
                match outcome {
                    Ok(_) => return,
                    Err(Error::TransactionFailed(_)) => {}
                    Err(e) => {
                        warn!(%room_id, error = %e, "Failed to expire pings");
                        return;
                    }
                }
            }
            warn!(%room_id, "Giving up expiring pings after repeated contention");
        });

        let mut ping_tasks = ctx.ping_tasks.lock().unwrap();
        ping_tasks.retain(|task| !task.is_finished());
        ping_tasks.push(task.abort_handle());
    }

    async fn unsubscribe(&self, room_id: &str, ctx: &Arc<RoomContext>, session_id: &str) {
        let mut rooms = self.rooms.lock().await;
        let now_empty = {
            let mut subscribers = ctx.subscribers.lock().unwrap();
            subscribers.retain(|(id, _)| id != session_id);
            subscribers.is_empty()
        };
        if !now_empty {
            return;
        }

        if rooms
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, ctx))
        {
            rooms.remove(room_id);
        }
        if let Some(task) = ctx.feed_task.lock().unwrap().take() {
            task.abort();
        }
        for task in ctx.ping_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        debug!(%room_id, "Evicted room context");
    }
}

/// Runs a request against a freshly loaded board. Invalid updates turn into
/// error responses and the rest still apply; the terminal response is
/// always one full-state snapshot.
fn apply_updates(entities: Vec<Entity>, request: &Request, session_id: &str) -> Mutation {
    let mut room = Room::new(entities);
    let mut responses = Vec::new();

    for update in &request.updates {
        match update {
            Update::Create { data } | Update::Update { data } => {
                if !data.is_well_formed() {
                    responses.push(error_response("Token is invalid", request, session_id));
                } else if room.is_valid_position(data) {
                    room.upsert(data.clone());
                } else {
                    info!("Token {} cannot move to an occupied position", data.id);
                    responses.push(error_response(
                        "That position is occupied",
                        request,
                        session_id,
                    ));
                }
            }
            Update::Delete { data } => {
                if !room.delete(data) {
                    responses.push(error_response(
                        "Cannot delete token because it does not exist",
                        request,
                        session_id,
                    ));
                }
            }
            Update::Ping { data } => room.place_ping(data.clone()),
        }
    }

    let entities = room.snapshot();
    responses.push(Response::State {
        data: entities.clone(),
        request_id: request.request_id.clone(),
    });
    Mutation {
        entities,
        responses,
    }
}

fn error_response(message: &str, request: &Request, session_id: &str) -> Response {
    Response::Error {
        data: message.to_owned(),
        request_id: request.request_id.clone(),
        session_id: session_id.to_owned(),
    }
}
