// LLM API gateway: accepts Anthropic Messages-shaped requests and dispatches
// them to heterogeneous upstream providers, translating wire formats and
// keeping same-conversation requests strictly ordered. See `lib.rs` for the
// module layout and `run`'s startup sequence.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    llm_gateway::run().await
}
