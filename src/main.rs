fn main() -> anyhow::Result<()> {
    dynobench_lib::run()
}
