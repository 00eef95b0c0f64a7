//! `<USER_DATA>` generation.
//!
//! `<USER_DATA>` is the one placeholder allowed to survive resolution; at
//! execution time it is replaced with a generated cloud-init script built
//! from current bindings.

use crate::bindings::BindingStore;

/// Replace `<USER_DATA>` tokens in the argv with a generated script.
pub fn apply_user_data(args: &mut [String], bindings: &BindingStore) {
    if !args.iter().any(|a| a.contains("<USER_DATA>")) {
        return;
    }
    let script = generate_user_data(bindings);
    for arg in args.iter_mut() {
        if arg.contains("<USER_DATA>") {
            *arg = arg.replace("<USER_DATA>", &script);
        }
    }
}

/// Render the instance bootstrap script.
///
/// With an `ECR_REPO_URI` or `IMAGE_URI` binding the instance logs into ECR
/// and runs the image on `APP_PORT`; otherwise it serves a placeholder page
/// so health checks pass.
pub fn generate_user_data(bindings: &BindingStore) -> String {
    let port = bindings.get("APP_PORT").unwrap_or("8080");
    let image = bindings.get("IMAGE_URI").or_else(|| bindings.get("ECR_REPO_URI"));

    let mut script = String::from("#!/bin/bash\nset -euo pipefail\n");
    match image {
        Some(image) => {
            let registry = image.split('/').next().unwrap_or(image);
            script.push_str("dnf install -y docker || yum install -y docker\n");
            script.push_str("systemctl enable --now docker\n");
            script.push_str(&format!(
                "aws ecr get-login-password | docker login --username AWS --password-stdin {registry}\n"
            ));
            script.push_str(&format!(
                "docker run -d --restart unless-stopped -p {port}:{port} {image}\n"
            ));
        }
        None => {
            script.push_str("dnf install -y nginx || yum install -y nginx\n");
            script.push_str(&format!(
                "sed -i 's/listen       80;/listen       {port};/' /etc/nginx/nginx.conf || true\n"
            ));
            script.push_str("systemctl enable --now nginx\n");
        }
    }
    script
}
