//! Process-scoped placeholder bindings.
//!
//! A binding maps a canonical upper-case name (`VPC_ID`, `SG_ID`, ...) to a
//! resolved value learned from command output, the environment, or
//! remediation. The store lives and dies with one plan and is never
//! persisted.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::jsonx;

/// Mapping of canonical binding names to resolved values.
///
/// Writes of empty values are no-ops; learning paths use
/// [`BindingStore::set_if_absent`] so they never clobber explicit sets.
#[derive(Debug, Clone, Default)]
pub struct BindingStore {
    values: BTreeMap<String, String>,
}

impl BindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Idempotent set. Empty keys and values are ignored, as are values that
    /// fail the compatibility predicate for the key family.
    pub fn set(&mut self, key: &str, value: &str) {
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return;
        }
        if !compatible(key, value) {
            return;
        }
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Set only when the key is not already bound.
    pub fn set_if_absent(&mut self, key: &str, value: &str) {
        if !self.has(key) {
            self.set(key, value);
        }
    }

    /// Copy of the current bindings.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Learn declared bindings from a step's stdout JSON.
    ///
    /// `produces` maps binding name to a dotted extraction path. Missing
    /// paths are skipped silently; the output may legitimately omit fields.
    pub fn learn_from_produces(&mut self, produces: &BTreeMap<String, String>, output: &str) {
        if produces.is_empty() {
            return;
        }
        let Ok(json) = serde_json::from_str::<Value>(output.trim()) else {
            return;
        };
        for (name, path) in produces {
            if let Some(value) = jsonx::extract_string(&json, path) {
                self.set_if_absent(name, &value);
            }
        }
    }

    /// Learn well-known fields heuristically from common CLI output shapes.
    pub fn learn_plan_bindings(&mut self, args: &[String], output: &str) {
        let Ok(json) = serde_json::from_str::<Value>(output.trim()) else {
            return;
        };

        for (path, key) in HEURISTIC_FIELDS {
            if let Some(value) = jsonx::extract_string(&json, path) {
                self.set_if_absent(key, &value);
            }
        }

        // Subnets get positional names so multi-AZ steps can reference both.
        if let Some(subnet) = jsonx::extract_string(&json, "Subnet.SubnetId") {
            if self.get("SUBNET_A").is_none() {
                self.set("SUBNET_A", &subnet);
            } else if self.get("SUBNET_A") != Some(subnet.as_str()) {
                self.set_if_absent("SUBNET_B", &subnet);
            }
        }

        // secretsmanager create-secret returns a bare "ARN" field.
        if args.first().map(String::as_str) == Some("secretsmanager") {
            if let Some(arn) = jsonx::extract_string(&json, "ARN") {
                self.set_if_absent("SECRET_ARN", &arn);
            }
        }
    }
}

/// Heuristic extraction table: output path -> canonical binding name.
const HEURISTIC_FIELDS: &[(&str, &str)] = &[
    ("Vpc.VpcId", "VPC_ID"),
    ("Subnet.SubnetId", "SUBNET_ID"),
    ("GroupId", "SG_ID"),
    ("Role.Arn", "ROLE_ARN"),
    ("InstanceProfile.Arn", "INSTANCE_PROFILE_ARN"),
    ("InternetGateway.InternetGatewayId", "IGW_ID"),
    ("RouteTable.RouteTableId", "RT_ID"),
    ("NatGateway.NatGatewayId", "NAT_GW_ID"),
    ("Instances[0].InstanceId", "INSTANCE_ID"),
    ("FunctionArn", "LAMBDA_ARN"),
    ("KeyName", "EC2_KEYPAIR_NAME"),
    ("LoadBalancers[0].LoadBalancerArn", "ALB_ARN"),
    ("LoadBalancers[0].DNSName", "ALB_DNS"),
    ("TargetGroups[0].TargetGroupArn", "TG_ARN"),
    ("CertificateArn", "CERT_ARN"),
    ("Certificate.CertificateArn", "CERT_ARN"),
    ("Distribution.Id", "CLOUDFRONT_ID"),
    ("Distribution.DomainName", "CLOUDFRONT_DOMAIN"),
    ("Table.TableArn", "TABLE_ARN"),
    ("QueueUrl", "QUEUE_URL"),
    ("TopicArn", "TOPIC_ARN"),
    ("repository.repositoryUri", "ECR_REPO_URI"),
    ("cluster.arn", "EKS_CLUSTER_ARN"),
];

/// Resource-id prefix expected for a key family, where one exists.
///
/// A value that violates its family prefix is obviously wrong (a subnet id
/// bound to an `SG_*` key) and is rejected at set time.
fn expected_prefix(key: &str) -> Option<&'static str> {
    let rules: &[(&[&str], &str)] = &[
        (&["SG_", "SECURITY_GROUP"], "sg-"),
        (&["VPC_ID", "VPC_A", "VPC_B"], "vpc-"),
        (&["SUBNET_"], "subnet-"),
        (&["IGW"], "igw-"),
        (&["RT_", "ROUTE_TABLE"], "rtb-"),
        (&["NAT_"], "nat-"),
        (&["ENI"], "eni-"),
        (&["INSTANCE_ID"], "i-"),
        (&["AMI_", "IMAGE_ID"], "ami-"),
    ];
    for (prefixes, expect) in rules {
        for p in *prefixes {
            if key.starts_with(p) || key == p.trim_end_matches('_') {
                return Some(expect);
            }
        }
    }
    if key.ends_with("_ARN") {
        return Some("arn:");
    }
    None
}

/// Whether `value` is plausible for `key`'s family.
pub fn compatible(key: &str, value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    match expected_prefix(key) {
        Some(prefix) => value.starts_with(prefix),
        None => {
            if key.ends_with("_CIDR") || key.contains("CIDR") {
                return value.contains('/');
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_has() {
        let mut store = BindingStore::new();
        store.set("VPC_ID", "vpc-0a1b2c");
        assert!(store.has("VPC_ID"));
        assert_eq!(store.get("VPC_ID"), Some("vpc-0a1b2c"));
        assert!(!store.has("SG_ID"));
    }

    #[test]
    fn test_set_empty_value_is_noop() {
        let mut store = BindingStore::new();
        store.set("VPC_ID", "");
        assert!(!store.has("VPC_ID"));
    }

    #[test]
    fn test_set_if_absent_does_not_clobber() {
        let mut store = BindingStore::new();
        store.set("SG_ID", "sg-first");
        store.set_if_absent("SG_ID", "sg-second");
        assert_eq!(store.get("SG_ID"), Some("sg-first"));
    }

    #[test]
    fn test_incompatible_value_rejected() {
        let mut store = BindingStore::new();
        store.set("SG_ID", "subnet-123");
        assert!(!store.has("SG_ID"));
        store.set("SG_ID", "sg-123");
        assert!(store.has("SG_ID"));
    }

    #[test]
    fn test_arn_keys_require_arn_prefix() {
        let mut store = BindingStore::new();
        store.set("ALB_ARN", "not-an-arn");
        assert!(!store.has("ALB_ARN"));
        store.set(
            "ALB_ARN",
            "arn:aws:elasticloadbalancing:us-east-1:1:loadbalancer/app/x/y",
        );
        assert!(store.has("ALB_ARN"));
    }

    #[test]
    fn test_cidr_keys_require_slash() {
        assert!(compatible("ADMIN_CIDR", "1.2.3.4/32"));
        assert!(!compatible("ADMIN_CIDR", "1.2.3.4"));
    }

    #[test]
    fn test_learn_from_produces() {
        let mut store = BindingStore::new();
        let mut produces = BTreeMap::new();
        produces.insert("VPC_ID".to_string(), "Vpc.VpcId".to_string());
        store.learn_from_produces(&produces, r#"{"Vpc":{"VpcId":"vpc-777","State":"pending"}}"#);
        assert_eq!(store.get("VPC_ID"), Some("vpc-777"));
    }

    #[test]
    fn test_learn_from_produces_ignores_non_json() {
        let mut store = BindingStore::new();
        let mut produces = BTreeMap::new();
        produces.insert("VPC_ID".to_string(), "Vpc.VpcId".to_string());
        store.learn_from_produces(&produces, "plain text output");
        assert!(store.is_empty());
    }

    #[test]
    fn test_learn_plan_bindings_heuristics() {
        let mut store = BindingStore::new();
        let args: Vec<String> = vec!["ec2".into(), "create-vpc".into()];
        store.learn_plan_bindings(&args, r#"{"Vpc":{"VpcId":"vpc-9"}}"#);
        assert_eq!(store.get("VPC_ID"), Some("vpc-9"));
    }

    #[test]
    fn test_learn_subnets_positionally() {
        let mut store = BindingStore::new();
        let args: Vec<String> = vec!["ec2".into(), "create-subnet".into()];
        store.learn_plan_bindings(&args, r#"{"Subnet":{"SubnetId":"subnet-aaa"}}"#);
        store.learn_plan_bindings(&args, r#"{"Subnet":{"SubnetId":"subnet-bbb"}}"#);
        assert_eq!(store.get("SUBNET_A"), Some("subnet-aaa"));
        assert_eq!(store.get("SUBNET_B"), Some("subnet-bbb"));
    }

    #[test]
    fn test_learn_secret_arn() {
        let mut store = BindingStore::new();
        let args: Vec<String> = vec!["secretsmanager".into(), "create-secret".into()];
        store.learn_plan_bindings(
            &args,
            r#"{"ARN":"arn:aws:secretsmanager:us-east-1:1:secret:s-abc","Name":"s"}"#,
        );
        assert_eq!(
            store.get("SECRET_ARN"),
            Some("arn:aws:secretsmanager:us-east-1:1:secret:s-abc")
        );
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut store = BindingStore::new();
        store.set("APP_PORT", "8080");
        let snap = store.snapshot();
        store.set("APP_PORT2", "9090");
        assert_eq!(snap.len(), 1);
    }
}
