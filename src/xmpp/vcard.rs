// Profile (vCard, XEP-0054) fetch and publish.

use log::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::Element;

use crate::error::EngineError;
use crate::events::Event;
use crate::models::UserProfile;
use crate::utils::bare_jid;
use crate::xmpp::{iq_error_text, ns, SessionEngine};

impl SessionEngine {
    /// Fetch a profile. `None` as the address fetches the local user's own
    /// vCard and refreshes the session's profile snapshot.
    ///
    /// Profile fetches are best-effort: every failure path logs and returns
    /// `None`, since a missing vCard must never break anything above it.
    pub async fn get_profile(&self, jid: Option<&str>) -> Option<UserProfile> {
        if self.ensure_connected().await.is_err() {
            warn!("Profile query attempted with no active session");
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let vcard = Element::builder("vCard", ns::VCARD).build();
        let mut builder = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "get")
            .attr("id", &id);
        if let Some(target) = jid {
            builder = builder.attr("to", bare_jid(target));
        }
        let iq = builder.append(vcard).build();

        let response = match self.send_iq(id, iq).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Profile query for {:?} failed: {}", jid, e);
                return None;
            }
        };
        if response.attr("type") != Some("result") {
            warn!(
                "Profile query for {:?} rejected: {}",
                jid,
                iq_error_text(&response)
            );
            return None;
        }
        let Some(vcard) = response.get_child("vCard", ns::VCARD) else {
            debug!("Profile response for {:?} carries no vCard", jid);
            return None;
        };

        let profile = parse_vcard(vcard);
        match jid {
            None => {
                let mut session = self.inner.session.lock().await;
                session.profile = Some(profile.clone());
                info!("Refreshed own profile snapshot");
            }
            Some(target) => {
                let snapshot = {
                    let mut roster = self.inner.roster.lock().await;
                    if roster.upsert_profile(bare_jid(target), profile.clone()) {
                        Some(roster.all())
                    } else {
                        None
                    }
                };
                if let Some(snapshot) = snapshot {
                    self.emit(Event::RosterChanged(snapshot));
                }
            }
        }
        Some(profile)
    }

    /// Publish the local user's vCard.
    pub async fn set_profile(&self, profile: &UserProfile) -> Result<(), EngineError> {
        self.ensure_connected().await?;

        let id = Uuid::new_v4().to_string();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", &id)
            .append(build_vcard(profile))
            .build();

        let response = self.send_iq(id, iq).await?;
        if response.attr("type") == Some("error") {
            return Err(EngineError::ProfileOperation(iq_error_text(&response)));
        }

        let mut session = self.inner.session.lock().await;
        session.profile = Some(profile.clone());
        info!("Published own profile");
        Ok(())
    }
}

fn child_text(parent: &Element, name: &str) -> Option<String> {
    parent
        .get_child(name, ns::VCARD)
        .or_else(|| parent.get_child(name, ""))
        .map(|el| el.text())
        .filter(|text| !text.is_empty())
}

fn child_of<'a>(parent: &'a Element, name: &str) -> Option<&'a Element> {
    parent
        .get_child(name, ns::VCARD)
        .or_else(|| parent.get_child(name, ""))
}

pub(crate) fn parse_vcard(vcard: &Element) -> UserProfile {
    let mut profile = UserProfile {
        full_name: child_text(vcard, "FN"),
        note: child_text(vcard, "NOTE"),
        ..UserProfile::default()
    };
    if let Some(name) = child_of(vcard, "N") {
        profile.first_name = child_text(name, "GIVEN");
        profile.last_name = child_text(name, "FAMILY");
    }
    if let Some(org) = child_of(vcard, "ORG") {
        profile.organization = child_text(org, "ORGNAME");
    }
    if let Some(adr) = child_of(vcard, "ADR") {
        profile.country = child_text(adr, "CTRY");
    }
    if let Some(photo) = child_of(vcard, "PHOTO") {
        profile.photo = child_text(photo, "BINVAL");
    }
    profile
}

fn text_element(name: &str, text: &str) -> Element {
    let mut element = Element::builder(name, ns::VCARD).build();
    element.append_text_node(text);
    element
}

pub(crate) fn build_vcard(profile: &UserProfile) -> Element {
    let mut vcard = Element::builder("vCard", ns::VCARD).build();

    if let Some(full_name) = &profile.full_name {
        vcard.append_child(text_element("FN", full_name));
    }
    if profile.first_name.is_some() || profile.last_name.is_some() {
        let mut name = Element::builder("N", ns::VCARD).build();
        if let Some(first_name) = &profile.first_name {
            name.append_child(text_element("GIVEN", first_name));
        }
        if let Some(last_name) = &profile.last_name {
            name.append_child(text_element("FAMILY", last_name));
        }
        vcard.append_child(name);
    }
    if let Some(organization) = &profile.organization {
        let mut org = Element::builder("ORG", ns::VCARD).build();
        org.append_child(text_element("ORGNAME", organization));
        vcard.append_child(org);
    }
    if let Some(country) = &profile.country {
        let mut adr = Element::builder("ADR", ns::VCARD).build();
        adr.append_child(text_element("CTRY", country));
        vcard.append_child(adr);
    }
    if let Some(note) = &profile.note {
        vcard.append_child(text_element("NOTE", note));
    }
    if let Some(photo) = &profile.photo {
        let mut photo_el = Element::builder("PHOTO", ns::VCARD).build();
        photo_el.append_child(text_element("BINVAL", photo));
        vcard.append_child(photo_el);
    }

    vcard
}
