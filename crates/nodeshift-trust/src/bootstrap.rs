//! Server-side publication script
//!
//! Runs on the node at first boot: reads the SSH host public key, wraps it in
//! an HS256 token signed with the shared secret, and PUTs it to the KV
//! service under the node uid until the service accepts it.

/// Render the publication snippet for a node
pub fn publish_script(kv_base_url: &str, uid: &str, secret: &str, validity_secs: u64) -> String {
    format!(
        r#"# publish signed host key
NS_KV_URL='{kv}'
NS_NODE_UID='{uid}'
NS_SECRET='{secret}'
ns_b64url() {{ openssl base64 -A | tr '+/' '-_' | tr -d '='; }}
NS_HOST_KEY="$(cut -d' ' -f1,2 /etc/ssh/ssh_host_ed25519_key.pub)"
NS_NOW="$(date +%s)"
NS_EXP="$((NS_NOW + {validity}))"
NS_HEADER="$(printf '{{"alg":"HS256","typ":"JWT"}}' | ns_b64url)"
NS_PAYLOAD="$(printf '{{"sub":"%s","host_key":"%s","iat":%s,"exp":%s}}' "$NS_NODE_UID" "$NS_HOST_KEY" "$NS_NOW" "$NS_EXP" | ns_b64url)"
NS_SIG="$(printf '%s.%s' "$NS_HEADER" "$NS_PAYLOAD" | openssl dgst -sha256 -hmac "$NS_SECRET" -binary | ns_b64url)"
until curl -fsS -X PUT --data "$NS_HEADER.$NS_PAYLOAD.$NS_SIG" "$NS_KV_URL/values/$NS_NODE_UID"; do
  sleep 5
done
unset NS_SECRET
"#,
        kv = kv_base_url.trim_end_matches('/'),
        uid = uid,
        secret = secret,
        validity = validity_secs,
    )
}
