fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    jhm::cli::run()
}
