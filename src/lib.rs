pub mod chat;
pub mod config;
pub mod discovery;
pub mod error;
pub mod messaging;
pub mod node;
pub mod peers;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            // .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
