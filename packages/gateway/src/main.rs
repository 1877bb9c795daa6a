fn main() {
    if let Err(err) = agent_gateway::cli::run_gateway() {
        tracing::error!(error = %err, "agent-gateway failed");
        std::process::exit(1);
    }
}
