fn main() -> anyhow::Result<()> {
    botmaster::bm::cli::run()
}
