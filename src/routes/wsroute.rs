use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::state::AppState;
use crate::websocket::protocol::{parse_client_event, ClientEvent, ServerEvent};
use crate::websocket::session::{ConnectionTarget, Outbound, SessionCore};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct OutboundFrame(Outbound);

/// WebSocket transport actor. Owns heartbeat and frame parsing; every piece
/// of protocol behaviour lives in [`SessionCore`], reached over channels.
struct WsTransport {
    hb: Instant,
    commands: UnboundedSender<ClientEvent>,
    outbound: Option<UnboundedReceiver<Outbound>>,
}

impl WsTransport {
    fn new(commands: UnboundedSender<ClientEvent>, outbound: UnboundedReceiver<Outbound>) -> Self {
        Self {
            hb: Instant::now(),
            commands,
            outbound: Some(outbound),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!("websocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsTransport {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);

        // Bridge the session's outbound channel into the actor mailbox
        if let Some(mut outbound) = self.outbound.take() {
            let addr = ctx.address();
            actix::spawn(async move {
                while let Some(frame) = outbound.recv().await {
                    addr.do_send(OutboundFrame(frame));
                }
            });
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the command sender ends the session task, which leaves its
        // groups and broadcasts the offline presence
        tracing::debug!("websocket transport stopped");
    }
}

impl Handler<OutboundFrame> for WsTransport {
    type Result = ();

    fn handle(&mut self, frame: OutboundFrame, ctx: &mut Self::Context) {
        match frame.0 {
            Outbound::Event(event) => match serde_json::to_string(&event) {
                Ok(text) => ctx.text(text),
                Err(err) => tracing::error!(error = %err, "failed to serialize server event"),
            },
            Outbound::Close(reason) => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Other(reason.code()),
                    description: None,
                }));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsTransport {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.hb = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match parse_client_event(&text) {
                Ok(event) => {
                    let _ = self.commands.send(event);
                }
                Err(err) => {
                    // Malformed and unknown frames are reported without
                    // closing the connection
                    let event = ServerEvent::Error {
                        code: err.code,
                        error: err.message,
                    };
                    if let Ok(text) = serde_json::to_string(&event) {
                        ctx.text(text);
                    }
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("binary websocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "websocket close received");
                ctx.stop();
            }
            _ => {}
        }
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s).to_string())
}

/// Connection entry point. The path names a conversation id or the sentinel
/// `notifications`; a bearer token may arrive as a query parameter or an
/// Authorization header, or later over the socket as an authenticate event.
#[get("/ws/chat/{target}")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let target = ConnectionTarget::parse(&path.into_inner())
        .map_err(|_| actix_web::error::ErrorBadRequest("invalid conversation target"))?;
    let token = query.into_inner().token.or_else(|| bearer_token(&req));

    let (outbound_tx, outbound_rx) = unbounded_channel();
    let (command_tx, command_rx) = unbounded_channel();

    let session = SessionCore::new(state.get_ref().clone(), target, outbound_tx);
    tokio::spawn(session.run(token, command_rx));

    ws::start(WsTransport::new(command_tx, outbound_rx), &req, stream)
}
