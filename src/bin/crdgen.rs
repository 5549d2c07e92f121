//! Print the PostgresCluster CustomResourceDefinition as YAML

use kube::CustomResourceExt;
use replica_switch_operator::crd::PostgresCluster;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&PostgresCluster::crd())?);
    Ok(())
}
