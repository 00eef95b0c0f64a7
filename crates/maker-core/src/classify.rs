//! Failure classification from raw provider CLI output.
//!
//! Pure pattern matching over lowercased output. The resulting
//! [`FailureCategory`] is the primary remediation dispatch key; the code is
//! diagnostic and preserved in its original casing.

use crate::domain::{Failure, FailureCategory};

/// Well-known error tokens, checked in order against lowercased output.
///
/// First match wins; the stored code keeps the provider's casing.
const TOKENS: &[(&str, &str, FailureCategory)] = &[
    // Conflicts take priority over generic not-found phrasing because
    // several conflict messages also mention missing dependents.
    ("bucketnotempty", "BucketNotEmpty", FailureCategory::Conflict),
    ("dependencyviolation", "DependencyViolation", FailureCategory::Conflict),
    ("deleteconflict", "DeleteConflict", FailureCategory::Conflict),
    ("resourceinuseexception", "ResourceInUseException", FailureCategory::Conflict),
    ("toomanyupdates", "TooManyUpdates", FailureCategory::Conflict),
    ("transactioninprogress", "TransactionInProgress", FailureCategory::Conflict),
    ("wafoptimisticlock", "WAFOptimisticLock", FailureCategory::Conflict),
    ("priorrequestnotcomplete", "PriorRequestNotComplete", FailureCategory::Conflict),
    ("limitexceeded", "LimitExceeded", FailureCategory::Conflict),
    ("conflictexception", "ConflictException", FailureCategory::Conflict),
    ("operationaborted", "OperationAborted", FailureCategory::Conflict),
    // Already-exists family.
    ("entityalreadyexists", "EntityAlreadyExists", FailureCategory::AlreadyExists),
    ("bucketalreadyownedbyyou", "BucketAlreadyOwnedByYou", FailureCategory::AlreadyExists),
    ("resourceexistsexception", "ResourceExistsException", FailureCategory::AlreadyExists),
    ("duplicatetargetgroupname", "DuplicateTargetGroupName", FailureCategory::AlreadyExists),
    ("duplicateloadbalancername", "DuplicateLoadBalancerName", FailureCategory::AlreadyExists),
    ("alreadyexists", "AlreadyExists", FailureCategory::AlreadyExists),
    ("already exists", "AlreadyExists", FailureCategory::AlreadyExists),
    // Throttling.
    ("throttling", "Throttling", FailureCategory::Throttled),
    ("requestlimitexceeded", "RequestLimitExceeded", FailureCategory::Throttled),
    ("toomanyrequests", "TooManyRequests", FailureCategory::Throttled),
    ("rate exceeded", "Throttling", FailureCategory::Throttled),
    // Access.
    ("accessdenied", "AccessDenied", FailureCategory::AccessDenied),
    ("unauthorizedoperation", "UnauthorizedOperation", FailureCategory::AccessDenied),
    ("not authorized", "AccessDenied", FailureCategory::AccessDenied),
    // Not-found family.
    ("resourcenotfoundexception", "ResourceNotFoundException", FailureCategory::NotFound),
    ("nosuchentity", "NoSuchEntity", FailureCategory::NotFound),
    ("invalidinstanceid.notfound", "InvalidInstanceID.NotFound", FailureCategory::NotFound),
    ("invalidsubnetid.notfound", "InvalidSubnetID.NotFound", FailureCategory::NotFound),
    // API Gateway v1 reports a missing API with this phrase and no code.
    ("invalid api identifier specified", "NotFoundException", FailureCategory::NotFound),
    ("nosuchbucket", "NoSuchBucket", FailureCategory::NotFound),
    ("notfoundexception", "NotFoundException", FailureCategory::NotFound),
    (".notfound", "NotFound", FailureCategory::NotFound),
    ("does not exist", "NotFound", FailureCategory::NotFound),
    ("could not be found", "NotFound", FailureCategory::NotFound),
    ("no such entity", "NoSuchEntity", FailureCategory::NotFound),
    // Validation.
    ("invalidsubnet.range", "InvalidSubnet.Range", FailureCategory::Validation),
    ("invalidvpc.range", "InvalidVpc.Range", FailureCategory::Validation),
    ("invalidparametervalueexception", "InvalidParameterValueException", FailureCategory::Validation),
    ("invalidparameter", "InvalidParameter", FailureCategory::Validation),
    ("validationerror", "ValidationError", FailureCategory::Validation),
    ("validationexception", "ValidationException", FailureCategory::Validation),
    ("missingparameter", "MissingParameter", FailureCategory::Validation),
    ("invalid choice", "InvalidChoice", FailureCategory::Validation),
    ("malformedpolicydocument", "MalformedPolicyDocument", FailureCategory::Validation),
    // Transient.
    ("serviceunavailable", "ServiceUnavailable", FailureCategory::Transient),
    ("internalerror", "InternalError", FailureCategory::Transient),
    ("internal error", "InternalError", FailureCategory::Transient),
    ("requesttimeout", "RequestTimeout", FailureCategory::Transient),
    ("connection reset", "ConnectionReset", FailureCategory::Transient),
    ("timed out", "Timeout", FailureCategory::Transient),
];

/// Map raw CLI output to a classified failure.
///
/// `op` is taken from `args[1]`, trimmed; the function is pure.
pub fn classify_failure(args: &[String], output: &str) -> Failure {
    let op = args.get(1).map(|s| s.trim()).unwrap_or("").to_string();
    let lc = output.to_lowercase();

    for (needle, code, category) in TOKENS {
        if lc.contains(needle) {
            return Failure::new(*code, *category, op);
        }
    }

    Failure::new("", FailureCategory::Unknown, op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_bucket_not_empty() {
        let f = classify_failure(
            &argv(&["s3api", "delete-bucket", "--bucket", "b"]),
            "An error occurred (BucketNotEmpty) when calling the DeleteBucket operation",
        );
        assert_eq!(f.category, FailureCategory::Conflict);
        assert_eq!(f.code, "BucketNotEmpty");
        assert_eq!(f.op, "delete-bucket");
    }

    #[test]
    fn test_classify_already_exists_beats_generic_phrase() {
        let f = classify_failure(
            &argv(&["iam", "create-role"]),
            "An error occurred (EntityAlreadyExists): Role with name r already exists.",
        );
        assert_eq!(f.category, FailureCategory::AlreadyExists);
        assert_eq!(f.code, "EntityAlreadyExists");
    }

    #[test]
    fn test_classify_throttling() {
        let f = classify_failure(
            &argv(&["ec2", "describe-instances"]),
            "An error occurred (ThrottlingException): Rate exceeded",
        );
        assert_eq!(f.category, FailureCategory::Throttled);
    }

    #[test]
    fn test_classify_instance_not_found() {
        let f = classify_failure(
            &argv(&["ec2", "terminate-instances"]),
            "An error occurred (InvalidInstanceID.NotFound): The instance ID 'i-0abc' does not exist",
        );
        assert_eq!(f.category, FailureCategory::NotFound);
        assert_eq!(f.code, "InvalidInstanceID.NotFound");
    }

    #[test]
    fn test_classify_apigw_v1_missing_api_phrase() {
        let f = classify_failure(
            &argv(&["apigateway", "delete-rest-api"]),
            "An error occurred (NotFoundException): Invalid API identifier specified 123:abc",
        );
        assert_eq!(f.category, FailureCategory::NotFound);
    }

    #[test]
    fn test_classify_subnet_range_is_validation() {
        let f = classify_failure(
            &argv(&["ec2", "create-subnet"]),
            "An error occurred (InvalidSubnet.Range): The CIDR '10.0.1.0/24' is invalid.",
        );
        assert_eq!(f.category, FailureCategory::Validation);
        assert_eq!(f.code, "InvalidSubnet.Range");
    }

    #[test]
    fn test_classify_unknown() {
        let f = classify_failure(&argv(&["ec2", "describe-vpcs"]), "something novel happened");
        assert_eq!(f.category, FailureCategory::Unknown);
        assert!(f.code.is_empty());
    }

    #[test]
    fn test_classify_limit_exceeded_is_conflict() {
        let f = classify_failure(
            &argv(&["iam", "add-role-to-instance-profile"]),
            "An error occurred (LimitExceeded): Cannot exceed quota for InstanceProfilesPerRole",
        );
        assert_eq!(f.category, FailureCategory::Conflict);
        assert_eq!(f.code, "LimitExceeded");
    }

    #[test]
    fn test_classify_empty_args() {
        let f = classify_failure(&[], "whatever");
        assert_eq!(f.op, "");
        assert_eq!(f.category, FailureCategory::Unknown);
    }
}
