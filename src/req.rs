use std::time::Duration;

use crate::api::Problem;

pub(crate) type ReqResult<T> = std::result::Result<T, Problem>;

/// Default HTTP client used when the caller does not inject one.
pub(crate) fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("default reqwest client")
}

pub(crate) async fn req_get(client: &reqwest::Client, url: &str) -> ReqResult<reqwest::Response> {
    log::trace!("GET {url}");
    client.get(url).send().await.map_err(transport_problem)
}

pub(crate) async fn req_head(client: &reqwest::Client, url: &str) -> ReqResult<reqwest::Response> {
    log::trace!("HEAD {url}");
    client.head(url).send().await.map_err(transport_problem)
}

pub(crate) async fn req_post(
    client: &reqwest::Client,
    url: &str,
    body: String,
) -> ReqResult<reqwest::Response> {
    log::trace!("POST {url} {body}");
    client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
        .body(body)
        .send()
        .await
        .map_err(transport_problem)
}

fn transport_problem(err: reqwest::Error) -> Problem {
    Problem {
        _type: "httpReqError".into(),
        detail: Some(err.to_string()),
        ..Problem::default()
    }
}

pub(crate) async fn req_handle_error(res: reqwest::Response) -> ReqResult<reqwest::Response> {
    // ok responses pass through
    if res.status().is_success() {
        return Ok(res);
    }

    let content_type = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let problem = if content_type.contains("problem+json") {
        // if we were sent a problem+json, deserialize it
        let body = req_safe_read_body(res).await;
        serde_json::from_str(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".into(),
            detail: Some(format!(
                "Failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            ..Problem::default()
        })
    } else {
        // some other problem
        let status = res.status();
        let body = req_safe_read_body(res).await;
        Problem {
            _type: "httpReqError".into(),
            status: Some(status.as_u16()),
            detail: Some(format!("{status} body: {body}")),
            ..Problem::default()
        }
    };

    Err(problem)
}

pub(crate) fn req_expect_header(res: &reqwest::Response, name: &str) -> ReqResult<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
        .ok_or_else(|| Problem {
            _type: format!("Missing header: {}", name),
            ..Problem::default()
        })
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // letsencrypt sometimes closes the TLS abruptly causing io error
    // even though we did capture the body.
    res.text().await.unwrap_or_default()
}
