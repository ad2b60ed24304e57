use crate::config::StaticRecord;
use crate::lifecycle::ShutdownSubscription;
use crate::store::Store;
use anyhow::Context;
use futures::FutureExt;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, AAAA, TXT};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use ip_label::DecodedName;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Synthesized and challenge records must not be cached by recursors.
const RECORD_TTL: u32 = 0;

/// Bound on a single challenge-store read from the DNS path.
const STORE_READ_DEADLINE: Duration = Duration::from_secs(5);

/// Large enough for any EDNS0 payload we are willing to accept.
const MAX_PACKET: usize = 4096;

/// Authoritative handler for the root zone. Address answers are
/// synthesized from the query name alone; only `_acme-challenge`
/// questions touch the challenge store.
pub struct DnsHandler {
    root_domain: String,
    static_records: HashMap<String, StaticRecord>,
    store: Arc<dyn Store>,
}

impl DnsHandler {
    pub fn new(
        root_domain: String,
        static_records: HashMap<String, StaticRecord>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            root_domain,
            static_records,
            store,
        }
    }

    /// Parse one datagram and produce the encoded reply, if any.
    async fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!("dropping unparseable dns packet: {err:#}");
                return None;
            }
        };

        let request_id = request.id();
        let reply = match AssertUnwindSafe(self.handle_message(&request))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(_) => {
                tracing::error!(request_id, "panic while handling dns request");
                return None;
            }
        };

        match reply.to_vec() {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                tracing::error!(request_id, "failed to encode dns reply: {err:#}");
                None
            }
        }
    }

    pub async fn handle_message(&self, request: &Message) -> Message {
        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_authoritative(true);
        for query in request.queries() {
            reply.add_query(query.clone());
        }

        for query in request.queries() {
            tracing::debug!(
                request_id = request.id(),
                name = %query.name(),
                qtype = %query.query_type(),
                qclass = %query.query_class(),
                "dns question"
            );

            if query.query_class() != DNSClass::IN {
                continue;
            }

            let qname = query.name().to_ascii();
            let decoded = ip_label::decode(&qname, &self.root_domain, |label| {
                self.static_records.contains_key(label)
            });

            match decoded {
                None => {}
                Some(DecodedName::Apex) => self.append_static(&mut reply, query, "@"),
                Some(DecodedName::Static(label)) => self.append_static(&mut reply, query, &label),
                Some(DecodedName::Challenge(id)) => {
                    if query.query_type() != RecordType::TXT {
                        continue;
                    }
                    tracing::debug!(request_id = request.id(), %id, "acme challenge lookup");

                    // A store failure silences this question only; any
                    // other questions in the message still get answers.
                    match tokio::time::timeout(STORE_READ_DEADLINE, self.store.get_challenge(id))
                        .await
                    {
                        Ok(Ok(values)) => {
                            for value in values {
                                reply.add_answer(Record::from_rdata(
                                    query.name().clone(),
                                    RECORD_TTL,
                                    RData::TXT(TXT::new(vec![value])),
                                ));
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::error!(
                                request_id = request.id(),
                                %id,
                                "challenge lookup failed: {err:#}"
                            );
                        }
                        Err(_) => {
                            tracing::error!(
                                request_id = request.id(),
                                %id,
                                "challenge lookup timed out"
                            );
                        }
                    }
                }
                Some(DecodedName::A(_, ip)) => {
                    if query.query_type() == RecordType::A {
                        reply.add_answer(Record::from_rdata(
                            query.name().clone(),
                            RECORD_TTL,
                            RData::A(A(ip)),
                        ));
                    }
                }
                Some(DecodedName::Aaaa(_, ip)) => {
                    if query.query_type() == RecordType::AAAA {
                        reply.add_answer(Record::from_rdata(
                            query.name().clone(),
                            RECORD_TTL,
                            RData::AAAA(AAAA(ip)),
                        ));
                    }
                }
            }
        }

        reply
    }

    fn append_static(&self, reply: &mut Message, query: &hickory_proto::op::Query, label: &str) {
        if query.query_type() != RecordType::A {
            return;
        }
        let Some(record) = self.static_records.get(label) else {
            return;
        };
        for ip in &record.a {
            reply.add_answer(Record::from_rdata(
                query.name().clone(),
                RECORD_TTL,
                RData::A(A(*ip)),
            ));
        }
    }
}

/// Datagram accept loop. Every packet is handled on its own task;
/// panics are contained there and never take the listener down.
pub async fn serve_udp(
    handler: Arc<DnsHandler>,
    socket: UdpSocket,
    mut shutdown: ShutdownSubscription,
) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let mut buf = [0u8; MAX_PACKET];

    loop {
        tokio::select! {
            _ = shutdown.shutting_down() => {
                tracing::debug!("dns listener stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received.context("recv on dns socket")?;
                let packet = buf[..len].to_vec();
                let handler = Arc::clone(&handler);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_packet(&packet).await {
                        if let Err(err) = socket.send_to(&reply, peer).await {
                            tracing::debug!("failed to send dns reply to {peer}: {err:#}");
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, MAX_ENTRIES};
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::Name;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    const ID: &str = "a5e1a6e6-6d2b-4c3a-9f0e-0f95c8f6d6a1";

    fn handler_with_store() -> (DnsHandler, Arc<MemStore>) {
        let store = Arc::new(MemStore::new(
            MAX_ENTRIES,
            tempfile::tempdir().unwrap().path().join("stats.json"),
        ));
        let mut statics = HashMap::new();
        statics.insert(
            "@".to_string(),
            StaticRecord {
                a: vec![Ipv4Addr::new(203, 0, 113, 9)],
            },
        );
        let handler = DnsHandler::new(
            "dyn.direct".to_string(),
            statics,
            Arc::clone(&store) as Arc<dyn Store>,
        );
        (handler, store)
    }

    fn question(name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
        message
    }

    #[tokio::test]
    async fn synthesizes_a_from_label() {
        let (handler, _) = handler_with_store();
        let request = question(&format!("127-0-0-1-v4.{ID}.dyn.direct."), RecordType::A);
        let reply = handler.handle_message(&request).await;

        assert!(reply.authoritative());
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.answers().len(), 1);
        let record = &reply.answers()[0];
        assert_eq!(record.ttl(), 0);
        assert_eq!(record.data(), &RData::A(A(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(reply.additionals().is_empty());
    }

    #[tokio::test]
    async fn synthesizes_aaaa_from_label() {
        let (handler, _) = handler_with_store();
        let request = question(&format!("2001-db8--1-v6.{ID}.dyn.direct."), RecordType::AAAA);
        let reply = handler.handle_message(&request).await;

        assert_eq!(reply.answers().len(), 1);
        let record = &reply.answers()[0];
        assert_eq!(record.ttl(), 0);
        assert_eq!(
            record.data(),
            &RData::AAAA(AAAA("2001:db8::1".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn qtype_mismatch_is_silent() {
        let (handler, _) = handler_with_store();
        let request = question(&format!("127-0-0-1-v4.{ID}.dyn.direct."), RecordType::AAAA);
        let reply = handler.handle_message(&request).await;
        assert!(reply.authoritative());
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn challenge_returns_stored_values_in_order() {
        let (handler, store) = handler_with_store();
        let id = Uuid::parse_str(ID).unwrap();
        store
            .set_challenge(id, vec!["abc".to_string(), "def".to_string()])
            .await
            .unwrap();

        let request = question(&format!("_acme-challenge.{ID}.dyn.direct."), RecordType::TXT);
        let reply = handler.handle_message(&request).await;

        let texts: Vec<String> = reply
            .answers()
            .iter()
            .map(|record| match record.data() {
                RData::TXT(txt) => txt
                    .txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).to_string())
                    .collect::<String>(),
                other => panic!("unexpected rdata {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["abc".to_string(), "def".to_string()]);
        assert!(reply.answers().iter().all(|record| record.ttl() == 0));
    }

    #[tokio::test]
    async fn challenge_for_unknown_id_is_empty() {
        let (handler, _) = handler_with_store();
        let request = question(&format!("_acme-challenge.{ID}.dyn.direct."), RecordType::TXT);
        let reply = handler.handle_message(&request).await;
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn static_apex_answers_a_only() {
        let (handler, _) = handler_with_store();

        let reply = handler
            .handle_message(&question("dyn.direct.", RecordType::A))
            .await;
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(
            reply.answers()[0].data(),
            &RData::A(A(Ipv4Addr::new(203, 0, 113, 9)))
        );

        let reply = handler
            .handle_message(&question("dyn.direct.", RecordType::AAAA))
            .await;
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn static_label_shadows_challenge_lookup() {
        let (mut handler, store) = handler_with_store();
        handler
            .static_records
            .insert("_acme-challenge".to_string(), StaticRecord { a: vec![] });
        let id = Uuid::parse_str(ID).unwrap();
        store
            .set_challenge(id, vec!["abc".to_string()])
            .await
            .unwrap();

        // The shadowed label answers as a static record (no A records
        // configured here), never from the challenge store.
        let request = question("_acme-challenge.dyn.direct.", RecordType::TXT);
        let reply = handler.handle_message(&request).await;
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn non_internet_class_skipped() {
        let (handler, _) = handler_with_store();
        let mut request = Message::new();
        request
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query);
        let mut query = Query::query(
            Name::from_ascii(format!("127-0-0-1-v4.{ID}.dyn.direct.")).unwrap(),
            RecordType::A,
        );
        query.set_query_class(DNSClass::CH);
        request.add_query(query);

        let reply = handler.handle_message(&request).await;
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn unknown_names_silent() {
        let (handler, _) = handler_with_store();
        for name in [
            "elsewhere.example.com.",
            &format!("bogus-v9.{ID}.dyn.direct."),
            "one-label.dyn.direct.",
        ] {
            let reply = handler.handle_message(&question(name, RecordType::A)).await;
            assert!(reply.authoritative());
            assert!(reply.answers().is_empty(), "{name} should be silent");
        }
    }

    #[tokio::test]
    async fn questions_answered_independently() {
        let (handler, _) = handler_with_store();
        let mut request = question(&format!("127-0-0-1-v4.{ID}.dyn.direct."), RecordType::A);
        request.add_query(Query::query(
            Name::from_ascii("unrelated.example.com.").unwrap(),
            RecordType::A,
        ));
        request.add_query(Query::query(
            Name::from_ascii("dyn.direct.").unwrap(),
            RecordType::A,
        ));

        let reply = handler.handle_message(&request).await;
        assert_eq!(reply.queries().len(), 3);
        assert_eq!(reply.answers().len(), 2);
    }

    #[tokio::test]
    async fn case_insensitive_matching_echoes_query() {
        let (handler, _) = handler_with_store();
        let name = format!("127-0-0-1-V4.{}.DYN.Direct.", ID.to_uppercase());
        let request = question(&name, RecordType::A);
        let reply = handler.handle_message(&request).await;
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(
            reply.answers()[0].name().to_ascii().to_ascii_lowercase(),
            format!("127-0-0-1-v4.{ID}.dyn.direct.")
        );
    }
}
