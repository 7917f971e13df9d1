//! HTTPS client tests against a local mock server.

use cirrus_id::{AddressId, InstanceId, SecurityGroupId, TaskId};
use cirrus_provisioner::client::{Credentials, TencentClient};
use cirrus_networking::Protocol;
use cirrus_provisioner::provider::{Tag, TagFilter, TaskResult};
use cirrus_provisioner::security::SecurityGroupReconciler;
use cirrus_provisioner::{ApiError, CloudApi, ClusterSpec};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> TencentClient {
    TencentClient::new(
        Credentials {
            secret_id: "AKIDexample".to_string(),
            secret_key: "secret".to_string(),
        },
        "ap-guangzhou",
        Some(server.uri()),
    )
}

fn ok(body: serde_json::Value) -> ResponseTemplate {
    let mut response = body;
    response["RequestId"] = json!("req-1");
    ResponseTemplate::new(200).set_body_json(json!({ "Response": response }))
}

#[tokio::test]
async fn test_describe_instances_is_signed_and_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("X-TC-Action", "DescribeInstances"))
        .and(header("X-TC-Version", "2017-03-12"))
        .and(header("X-TC-Region", "ap-guangzhou"))
        .and(header_exists("X-TC-Timestamp"))
        .and(header_exists("Authorization"))
        .and(body_partial_json(json!({
            "Filters": [{ "Name": "tag:cirrus", "Values": ["true"] }],
            "Limit": 20,
        })))
        .respond_with(ok(json!({
            "TotalCount": 1,
            "InstanceSet": [{
                "InstanceId": "ins-abc123",
                "InstanceState": "RUNNING",
                "PrivateIpAddresses": ["192.168.3.4"],
                "PublicIpAddresses": null,
                "Tags": [{ "Key": "master", "Value": "true" }],
            }],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server)
        .describe_instances(&[Tag::new("cirrus", "true")], 0, 20)
        .await
        .unwrap();

    assert_eq!(page.total, 1);
    let instance = &page.instances[0];
    assert_eq!(instance.instance_id.as_str(), "ins-abc123");
    assert_eq!(instance.private_addresses, vec!["192.168.3.4"]);
    assert!(instance.public_addresses.is_empty());
    assert!(instance.has_flag_tag("master"));
}

#[tokio::test]
async fn test_provider_error_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "DisassociateAddress"))
        .respond_with(ok(json!({
            "Error": {
                "Code": "InvalidAddressIdStatus.NotBound",
                "Message": "address is not bound",
            },
        })))
        .mount(&server)
        .await;

    let address = AddressId::parse("eip-abc123").unwrap();
    let err = client(&server)
        .disassociate_address(&address)
        .await
        .unwrap_err();

    match &err {
        ApiError::Service {
            code, request_id, ..
        } => {
            assert_eq!(code, "InvalidAddressIdStatus.NotBound");
            assert_eq!(request_id, "req-1");
        }
        other => panic!("expected service error, got {other}"),
    }
    assert!(err.is_already_disassociated());
}

#[tokio::test]
async fn test_empty_disassociation_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "DisassociateAddress"))
        .respond_with(ok(json!({ "TaskId": "" })))
        .mount(&server)
        .await;

    let address = AddressId::parse("eip-abc123").unwrap();
    let task = client(&server).disassociate_address(&address).await.unwrap();

    assert_eq!(task, None);
}

#[tokio::test]
async fn test_allocate_and_poll_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "AllocateAddresses"))
        .and(body_partial_json(json!({ "AddressCount": 2 })))
        .respond_with(ok(json!({
            "AddressSet": ["eip-aaa111", "eip-bbb222"],
            "TaskId": "1001",
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "DescribeTaskResult"))
        .and(body_partial_json(json!({ "TaskId": 1001 })))
        .respond_with(ok(json!({ "TaskId": 1001, "Result": "SUCCESS" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let allocation = client
        .allocate_addresses(2, "TRAFFIC_POSTPAID_BY_HOUR", 5, &[])
        .await
        .unwrap();

    assert_eq!(allocation.address_ids.len(), 2);
    assert_eq!(allocation.task_id, TaskId::new(1001));
    assert_eq!(
        client.describe_task_result(allocation.task_id).await.unwrap(),
        TaskResult::Success
    );
}

#[tokio::test]
async fn test_tag_service_version_and_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "DescribeResourcesByTags"))
        .and(header("X-TC-Version", "2018-08-13"))
        .and(body_partial_json(json!({
            "TagFilters": [{ "TagKey": "cirrus", "TagValue": ["true"] }],
        })))
        .respond_with(ok(json!({
            "TotalCount": 1,
            "Rows": [{
                "ServiceType": "cvm",
                "ResourcePrefix": "eip",
                "ResourceId": "eip-abc123",
                "ResourceRegion": "ap-guangzhou",
            }],
        })))
        .mount(&server)
        .await;

    let filter = TagFilter::from(&Tag::new("cirrus", "true"));
    let page = client(&server)
        .describe_resources_by_tags(&[filter], 0, 100)
        .await
        .unwrap();

    assert_eq!(page.total, 1);
    assert_eq!(page.rows[0].resource_prefix, "eip");
    assert_eq!(page.rows[0].region, "ap-guangzhou");
}

#[tokio::test]
async fn test_malformed_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .terminate_instances(&[])
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Decode { .. }), "got {err}");
}

#[tokio::test]
async fn test_malformed_identifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "DescribeInstancesStatus"))
        .respond_with(ok(json!({
            "InstanceStatusSet": [{ "InstanceId": "bogus", "InstanceState": "RUNNING" }],
        })))
        .mount(&server)
        .await;

    let id = InstanceId::parse("ins-abc123").unwrap();
    let err = client(&server)
        .describe_instance_status(&[id])
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Decode { .. }), "got {err}");
}

#[tokio::test]
async fn test_unrelated_protocols_do_not_break_reconcile() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "DescribeSecurityGroupPolicies"))
        .respond_with(ok(json!({
            "SecurityGroupPolicySet": {
                "Ingress": [
                    { "Protocol": "GRE", "Port": "ALL", "CidrBlock": "10.0.0.0/8", "Action": "ACCEPT" },
                    { "Protocol": "", "Port": "", "CidrBlock": "", "Action": "ACCEPT" },
                ],
                "Egress": [],
            },
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("X-TC-Action", "CreateSecurityGroupPolicies"))
        .respond_with(ok(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let group = SecurityGroupId::parse("sg-abc123").unwrap();

    let policies = client.describe_security_group_policies(&group).await.unwrap();
    assert_eq!(policies.ingress[0].protocol, Protocol::Other("GRE".to_string()));
    assert_eq!(policies.ingress[1].protocol.as_str(), "");

    let report = SecurityGroupReconciler::new(&client)
        .reconcile_rules(&group, &ClusterSpec::default(), None)
        .await
        .unwrap();

    assert_eq!(report.added_ingress, vec![22, 8472, 6443, 10250, 2379, 2380]);
    assert!(report.added_egress);
}
