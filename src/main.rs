use diffusim::sim::SimulationConfig;

fn main() -> anyhow::Result<()> {
    diffusim::init_logging();
    let config = SimulationConfig::from_env()?;
    diffusim::run(config)
}
