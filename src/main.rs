fn main() {
    if let Err(e) = edgeviewer_lib::run() {
        tracing::error!("edgeviewer failed: {e}");
        std::process::exit(1);
    }
}
