fn main() -> anyhow::Result<()> {
    hookq::cli::run()
}
