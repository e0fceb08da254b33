use kube::CustomResourceExt;
use pg_cluster_operator::crd::{PostgresCluster, PostgresDbOps};

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&PostgresCluster::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&PostgresDbOps::crd())?);
    Ok(())
}
