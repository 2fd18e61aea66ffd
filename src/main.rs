fn main() -> anyhow::Result<()> {
    courier_sync::run()
}
