use chat_stream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    chat_stream::init_observability();
    let client = ChatClient::from_env()?;

    let abort = AbortHandle::new();
    let mut accumulator = ResponseAccumulator::new()
        .on_complete(|text, blocks| {
            println!();
            eprintln!("done: {} chars, {} code blocks", text.len(), blocks.len());
        })
        .on_error(|message| eprintln!("stream error: {message}"));

    let mut printer = |event: StreamEvent| {
        if event.kind() == EventKind::Token {
            let token = event.payload::<TokenPayload>();
            print!("{}", token.text().unwrap_or_default());
        }
        accumulator.apply(&event);
    };

    let request = GenerateRequest::new("llama3", "Stream a greeting.").language("en");
    let outcome = client.stream(&request, &mut printer, &abort).await?;
    if outcome == SessionOutcome::EndOfStream {
        accumulator.finish_unterminated();
    }
    Ok(())
}
