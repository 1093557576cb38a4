//! Prints the CRD manifests as a multi-document YAML stream.

use crds::DwOperator;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("---\n{}", serde_yaml::to_string(&DwOperator::crd())?);
    Ok(())
}
