//! Prints the OSLayer CustomResourceDefinitions as a multi-document YAML stream.
//!
//! `cargo run -p crds --bin crdgen > config/crd/oslayer.yaml`

use crds::{ImageBuild, ImageBuildConfig, MachinePool};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [MachinePool::crd(), ImageBuildConfig::crd(), ImageBuild::crd()];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
