use std::sync::Arc;

use teloxide::{
    dispatching::{DefaultKey, Dispatcher},
    dptree,
    prelude::*,
    types::{CallbackQuery, Message},
    update_listeners, RequestError,
};

use devbot_core::{
    domain::{ChannelId, MessageId, UserId},
    transport::types::{ButtonClick, EventSender, InboundMessage, TransportEvent},
};

pub(crate) type TelegramDispatcher = Dispatcher<Bot, RequestError, DefaultKey>;

/// Routes messages and callback queries into the session's event stream.
pub(crate) fn build_dispatcher(bot: Bot, tx: EventSender) -> TelegramDispatcher {
    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(forward_callback))
        .branch(Update::filter_message().endpoint(forward_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![tx])
        .build()
}

/// Runs long polling until shut down. Listener failures surface as
/// `TransportEvent::Error`.
pub(crate) async fn poll(dispatcher: &mut TelegramDispatcher, bot: Bot, tx: EventSender) {
    let listener = update_listeners::polling_default(bot).await;
    let on_error = move |e: RequestError| {
        let tx = tx.clone();
        async move {
            tracing::warn!("telegram polling error: {e}");
            let _ = tx.send(TransportEvent::Error(e.to_string()));
        }
    };
    dispatcher
        .dispatch_with_listener(listener, Arc::new(on_error))
        .await;
}

pub(crate) fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let text = msg.text().or_else(|| msg.caption())?;
    let author = msg.from()?;
    let mut inbound = InboundMessage::text(
        ChannelId(msg.chat.id.0),
        UserId(author.id.0 as i64),
        text,
    );
    inbound.message_id = Some(MessageId(msg.id.0));
    Some(inbound)
}

async fn forward_message(msg: Message, tx: EventSender) -> ResponseResult<()> {
    if let Some(inbound) = to_inbound(&msg) {
        tracing::debug!(chat_id = msg.chat.id.0, "message: {}", inbound.preview());
        let _ = tx.send(TransportEvent::Message(inbound));
    }
    Ok(())
}

async fn forward_callback(bot: Bot, q: CallbackQuery, tx: EventSender) -> ResponseResult<()> {
    // Always answer so the client stops its spinner.
    let _ = bot.answer_callback_query(q.id.clone()).await;

    let (Some(message), Some(data)) = (q.message.as_ref(), q.data.clone()) else {
        return Ok(());
    };
    let _ = tx.send(TransportEvent::ButtonClicked(ButtonClick {
        channel_id: ChannelId(message.chat.id.0),
        user_id: UserId(q.from.id.0 as i64),
        message_id: Some(MessageId(message.id.0)),
        custom_id: data,
    }));
    Ok(())
}
